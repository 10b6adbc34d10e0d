//! Record Batcher
//!
//! Accumulates records in memory until a size or time threshold is met,
//! then hands the drained batch to a flush callback. Batching amortizes the
//! cost of framing, compression, and durable-queue writes across many
//! records.
//!
//! ## Flush Triggers
//!
//! - **Size**: `put` on a full buffer flushes synchronously (resetting the
//!   timer origin) and then retries the enqueue — records are never dropped.
//! - **Time**: a background timer flushes every `max_batch_latency`,
//!   measured from the last flush of any kind. A timer flush of an empty
//!   buffer still invokes the callback with `None`; downstream uses that as
//!   a liveness signal.
//! - **Close**: `close()` issues a final flush.
//!
//! ## Concurrency
//!
//! Callback invocations are mutually excluded. Producers and the timer may
//! call `put`/flush concurrently; the flush lock serializes them. The timer
//! task holds only a `Weak` reference to the shared state, so dropping the
//! batcher lets the timer observe the drop and exit rather than keeping the
//! buffer alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::Result;

/// Receives each drained batch; `None` marks an empty timer flush.
pub type FlushCallback<R> =
    Arc<dyn Fn(Option<Vec<R>>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Size/time-bounded FIFO accumulator.
pub struct Batcher<R> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    buffer: Mutex<Buffer<R>>,
    /// Serializes callback invocations
    flush_lock: Mutex<()>,
    callback: FlushCallback<R>,
    max_batch_size: Option<usize>,
    closed: AtomicBool,
}

struct Buffer<R> {
    records: Vec<R>,
    last_flush: Instant,
}

impl<R: Send + 'static> Batcher<R> {
    /// Create a batcher. At least one of `max_batch_size` and
    /// `max_batch_latency` should be set; the journal config enforces this.
    pub fn new(
        max_batch_size: Option<usize>,
        max_batch_latency: Option<Duration>,
        callback: FlushCallback<R>,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                records: Vec::new(),
                last_flush: Instant::now(),
            }),
            flush_lock: Mutex::new(()),
            callback,
            max_batch_size,
            closed: AtomicBool::new(false),
        });

        if let Some(latency) = max_batch_latency {
            let weak = Arc::downgrade(&shared);
            tokio::spawn(timer_loop(weak, latency));
        }

        Self { shared }
    }

    /// Enqueue a record, flushing first if the buffer is full. Never drops:
    /// the enqueue is retried after the flush makes room.
    pub async fn put(&self, record: R) -> Result<()> {
        let mut pending = Some(record);
        loop {
            {
                let mut buffer = self.shared.buffer.lock().await;
                let full = self
                    .shared
                    .max_batch_size
                    .is_some_and(|max| buffer.records.len() >= max);
                if !full {
                    if let Some(record) = pending.take() {
                        buffer.records.push(record);
                    }
                    return Ok(());
                }
            }
            trace!("batch buffer full, flushing synchronously");
            Shared::flush(&self.shared).await?;
        }
    }

    /// Final flush. The timer exits on its next tick.
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Shared::flush(&self.shared).await
    }
}

impl<R: Send + 'static> Shared<R> {
    async fn flush(shared: &Arc<Shared<R>>) -> Result<()> {
        let _guard = shared.flush_lock.lock().await;
        let drained = {
            let mut buffer = shared.buffer.lock().await;
            buffer.last_flush = Instant::now();
            if buffer.records.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut buffer.records))
            }
        };
        (shared.callback)(drained).await
    }
}

async fn timer_loop<R: Send + 'static>(weak: Weak<Shared<R>>, latency: Duration) {
    loop {
        let deadline = match weak.upgrade() {
            Some(shared) => {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                shared.buffer.lock().await.last_flush + latency
            }
            None => return,
        };

        tokio::time::sleep_until(deadline).await;

        let Some(shared) = weak.upgrade() else { return };
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        // A put-full flush may have reset the clock while we slept
        let due = shared.buffer.lock().await.last_flush.elapsed() >= latency;
        if due {
            if let Err(e) = Shared::flush(&shared).await {
                warn!(error = %e, "timer flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    /// Callback that records every invocation.
    fn recording_callback(
        log: Arc<AsyncMutex<Vec<Option<Vec<u32>>>>>,
    ) -> FlushCallback<u32> {
        Arc::new(move |batch| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().await.push(batch);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_flush_when_full() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let batcher = Batcher::new(Some(2), None, recording_callback(log.clone()));

        batcher.put(1).await.unwrap();
        batcher.put(2).await.unwrap();
        assert!(log.lock().await.is_empty(), "no flush until a put finds the buffer full");

        batcher.put(3).await.unwrap();
        let flushed = log.lock().await;
        assert_eq!(flushed.as_slice(), &[Some(vec![1, 2])]);
    }

    #[tokio::test]
    async fn test_close_flushes_remainder() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let batcher = Batcher::new(Some(100), None, recording_callback(log.clone()));

        batcher.put(1).await.unwrap();
        batcher.close().await.unwrap();

        assert_eq!(log.lock().await.as_slice(), &[Some(vec![1])]);
    }

    #[tokio::test]
    async fn test_close_with_empty_buffer_signals_none() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let batcher = Batcher::new(Some(100), None, recording_callback(log.clone()));

        batcher.close().await.unwrap();
        assert_eq!(log.lock().await.as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_timer_flush() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let batcher = Batcher::new(
            None,
            Some(Duration::from_millis(20)),
            recording_callback(log.clone()),
        );

        batcher.put(7).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let flushed = log.lock().await;
        assert!(
            flushed.contains(&Some(vec![7])),
            "timer should have flushed the pending batch: {flushed:?}"
        );
    }

    #[tokio::test]
    async fn test_timer_emits_empty_liveness_flush() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let _batcher = Batcher::new(
            None,
            Some(Duration::from_millis(20)),
            recording_callback(log.clone()),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            log.lock().await.contains(&None),
            "empty timer flush should invoke the callback with None"
        );
    }

    #[tokio::test]
    async fn test_dropped_batcher_stops_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting: FlushCallback<u32> = {
            let calls = calls.clone();
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })
        };

        let batcher = Batcher::new(None, Some(Duration::from_millis(10)), counting);
        tokio::time::sleep(Duration::from_millis(35)).await;
        drop(batcher);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_drop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            calls.load(Ordering::SeqCst),
            after_drop,
            "timer must not fire after the batcher is dropped"
        );
    }

    #[tokio::test]
    async fn test_records_flush_in_submission_order() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let batcher = Batcher::new(Some(3), None, recording_callback(log.clone()));

        for i in 0..7 {
            batcher.put(i).await.unwrap();
        }
        batcher.close().await.unwrap();

        let flushed = log.lock().await;
        let all: Vec<u32> = flushed.iter().flatten().flatten().copied().collect();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
    }
}
