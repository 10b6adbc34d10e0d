//! Journal Public Surface
//!
//! A [`Journal`] accepts records, batches them, spills batches to the local
//! durable queue, and streams them to time-partitioned objects through the
//! multipart consumer. The write path:
//!
//! ```text
//! put(record)
//!     ↓ admission semaphore (non-blocking; full journal -> Ok(false))
//! Batcher                  ← in-memory, size/time bounded
//!     ↓ flush
//! Framer                   ← per-record framing + compression
//!     ↓ advance()          ← position transition, derived actions
//! DurableQueue             ← crash-safe spill, put acknowledged here
//!     ↓ take
//! Consumer                 ← single-task multipart upload FSM
//!     ↓
//! S3-compatible store
//! ```
//!
//! `put` returning `true` guarantees admission and, once the batch flushes,
//! local durability; upload is eventual and observable through
//! [`Journal::stats`]. The admission semaphore is released on S3
//! acknowledgment, not on enqueue, so a stalled store eventually pushes
//! back on producers end to end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use durable_queue::{DurableQueue, QueueConfig, QueueStats};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::info;

use crate::batcher::{Batcher, FlushCallback};
use crate::config::{DirectoryFormat, JournalConfig};
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::frame::{CompressFn, EncodeFn, Framer};
use crate::position::{advance, Action, Position};
use crate::store::{MultipartStore, PartLimits};
use crate::sweeper::Sweeper;

/// Durable-queue topic carrying the upload actions.
const ACTIONS_TOPIC: &str = "actions";

/// Source of the current time for directory partitioning. Overridable so
/// tests can pin the clock across a day boundary.
pub type ClockFn = dyn Fn() -> DateTime<Utc> + Send + Sync;

/// Counters reported by [`Journal::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    /// Records durably enqueued since open (including recovered ones)
    pub enqueued: u64,
    /// Records whose bytes are committed to the object store
    pub uploaded: u64,
    /// Durable-queue counters
    pub queue: QueueStats,
}

impl JournalStats {
    /// Numeric merge, used by the sharded fan-out.
    pub fn merge(&self, other: &JournalStats) -> JournalStats {
        JournalStats {
            enqueued: self.enqueued + other.enqueued,
            uploaded: self.uploaded + other.uploaded,
            queue: self.queue.merge(&other.queue),
        }
    }
}

/// Configures the non-serializable pieces of a journal before opening it.
pub struct JournalBuilder {
    config: JournalConfig,
    store: Arc<dyn MultipartStore>,
    encoder: Option<Arc<EncodeFn>>,
    custom_compressor: Option<Arc<CompressFn>>,
    directory_format: Option<DirectoryFormat>,
    drain_timeout: Duration,
    clock: Option<Arc<ClockFn>>,
}

impl JournalBuilder {
    /// Record-level encoder applied before framing (default: identity).
    pub fn encoder(mut self, encoder: Arc<EncodeFn>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Custom whole-batch compressor in place of the built-ins.
    pub fn custom_compressor(mut self, compressor: Arc<CompressFn>) -> Self {
        self.custom_compressor = Some(compressor);
        self
    }

    /// How long the consumer waits on an empty queue after `close()`
    /// before concluding it has drained (default: 5 seconds).
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Pre-parsed directory format override; the sharded fan-out uses this
    /// to prepend each shard's key prefix.
    pub(crate) fn directory_format(mut self, format: DirectoryFormat) -> Self {
        self.directory_format = Some(format);
        self
    }

    /// Clock used for directory partitioning (default: `Utc::now`).
    pub fn clock(mut self, clock: Arc<ClockFn>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config, run recovery, and start the pipeline.
    pub async fn open(self) -> Result<Journal> {
        let config = self.config;
        config.validate()?;

        let format = match self.directory_format {
            Some(format) => format,
            None => DirectoryFormat::parse(&config.directory_format)?,
        };
        let id = config.resolved_id();
        let suffix = config.resolved_suffix();
        let limits = config.limits;

        let queue = Arc::new(
            DurableQueue::open(QueueConfig {
                directory: config.local_directory.clone(),
                fsync: config.fsync,
            })
            .await?,
        );

        let semaphore = Arc::new(Semaphore::new(config.max_queue_size as usize));
        let enqueued = Arc::new(AtomicU64::new(0));
        let uploaded = Arc::new(AtomicU64::new(0));
        let close_latch = Arc::new(AtomicBool::new(false));

        let sweeper = config.expiration_ms.map(|ms| Sweeper {
            store: self.store.clone(),
            bucket: config.bucket.clone(),
            format: format.clone(),
            expiration: chrono::Duration::milliseconds(ms as i64),
        });

        let mut consumer = Consumer {
            queue: queue.clone(),
            topic: ACTIONS_TOPIC.to_string(),
            store: self.store.clone(),
            bucket: config.bucket.clone(),
            id: id.clone(),
            suffix,
            list_prefix: format.list_prefix(),
            limits,
            max_queue_size: config.max_queue_size,
            semaphore: semaphore.clone(),
            enqueued: enqueued.clone(),
            uploaded: uploaded.clone(),
            close_latch: close_latch.clone(),
            drain_timeout: self.drain_timeout,
            sweeper,
            upload_state: Default::default(),
            last_sweep: None,
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(Utc::now));

        // Recovery decides where fresh data starts: the next object
        // boundary at or above anything pending, committed, or completed
        let next_part = consumer.recover().await?;
        let directory = format.render(clock());
        let initial = Position::new(0, next_part, directory);
        queue
            .put(ACTIONS_TOPIC, Action::Start(initial.clone()).encode())
            .await?;

        info!(
            id = %id,
            bucket = %config.bucket,
            directory = %initial.directory,
            first_part = next_part,
            "journal opened"
        );

        let mut framer = Framer::new(config.delimiter.clone(), config.sized, config.compression);
        if let Some(encoder) = self.encoder {
            framer = framer.with_encoder(encoder);
        }
        if let Some(compressor) = self.custom_compressor {
            framer = framer.with_custom_compressor(compressor);
        }

        let callback = flush_callback(
            framer,
            format,
            limits,
            Arc::new(Mutex::new(initial)),
            queue.clone(),
            enqueued.clone(),
            clock,
        );
        let batcher = Batcher::new(
            config.max_batch_size,
            config.max_batch_latency_ms.map(Duration::from_millis),
            callback,
        );

        let consumer_handle = tokio::spawn(consumer.run());

        Ok(Journal {
            batcher,
            queue,
            semaphore,
            enqueued,
            uploaded,
            closed: AtomicBool::new(false),
            close_latch,
            consumer: Mutex::new(Some(consumer_handle)),
        })
    }
}

/// One journal pipeline: batcher, durable queue, and upload consumer.
pub struct Journal {
    batcher: Batcher<Bytes>,
    queue: Arc<DurableQueue>,
    semaphore: Arc<Semaphore>,
    enqueued: Arc<AtomicU64>,
    uploaded: Arc<AtomicU64>,
    closed: AtomicBool,
    close_latch: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Start configuring a journal.
    pub fn builder(config: JournalConfig, store: Arc<dyn MultipartStore>) -> JournalBuilder {
        JournalBuilder {
            config,
            store,
            encoder: None,
            custom_compressor: None,
            directory_format: None,
            drain_timeout: Duration::from_secs(5),
            clock: None,
        }
    }

    /// Open a journal with default hooks.
    pub async fn open(config: JournalConfig, store: Arc<dyn MultipartStore>) -> Result<Journal> {
        Self::builder(config, store).open().await
    }

    /// Submit one record.
    ///
    /// Returns `Ok(false)` when the journal is at capacity (records in
    /// flight have not yet reached the object store); the record is NOT
    /// accepted and the caller decides whether to retry or shed. Calling
    /// `put` on a closed journal is an error.
    pub async fn put(&self, record: impl Into<Bytes>) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        match self.semaphore.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Ok(false),
            Err(TryAcquireError::Closed) => return Err(Error::Closed),
        }

        if let Err(e) = self.batcher.put(record.into()).await {
            // The record never reached the buffer; give the permit back
            self.semaphore.add_permits(1);
            return Err(e);
        }
        Ok(true)
    }

    /// Current counters.
    pub async fn stats(&self) -> Result<JournalStats> {
        Ok(JournalStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            uploaded: self.uploaded.load(Ordering::SeqCst),
            queue: self.queue.stats(ACTIONS_TOPIC).await?,
        })
    }

    /// Flush everything and shut down: final batch flush, a `Flush` action
    /// closing every open object, then wait for the consumer to drain the
    /// queue and exit.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        self.batcher.close().await?;
        self.queue
            .put(ACTIONS_TOPIC, Action::Flush.encode())
            .await?;
        self.close_latch.store(true, Ordering::SeqCst);

        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Consumer(format!("consumer task failed: {e}")))?;
        }

        info!("journal closed");
        Ok(())
    }
}

/// Build the batcher callback: frame and compress the batch, advance the
/// position, and enqueue the derived actions in consumer-safe order.
fn flush_callback(
    framer: Framer,
    format: DirectoryFormat,
    limits: PartLimits,
    position: Arc<Mutex<Position>>,
    queue: Arc<DurableQueue>,
    enqueued: Arc<AtomicU64>,
    clock: Arc<ClockFn>,
) -> FlushCallback<Bytes> {
    Arc::new(move |batch: Option<Vec<Bytes>>| {
        let framer = framer.clone();
        let format = format.clone();
        let position = position.clone();
        let queue = queue.clone();
        let enqueued = enqueued.clone();
        let clock = clock.clone();

        Box::pin(async move {
            // An empty timer flush is only a liveness signal
            let Some(records) = batch else { return Ok(()) };
            if records.is_empty() {
                return Ok(());
            }

            let count = records.len() as u64;
            let blob = framer.encode_batch(Some(&records))?;

            // The batcher serializes flushes; the lock still guards the
            // position against a close-time flush racing a timer flush
            let mut position = position.lock().await;
            let directory_now = format.render(clock());
            let (next, actions) = advance(&position, &directory_now, blob.len() as u64, &limits);

            // Emission order: Start actions first so the consumer holds a
            // descriptor before any reference to a new object, then the
            // chunk itself, then the Upload/End actions that consume it
            let (starts, rest): (Vec<Action>, Vec<Action>) = actions
                .into_iter()
                .partition(|action| matches!(action, Action::Start(_)));
            for action in &starts {
                queue.put(ACTIONS_TOPIC, action.encode()).await?;
            }
            let append = Action::Append {
                position: next.clone(),
                count,
                payload: blob,
            };
            queue.put(ACTIONS_TOPIC, append.encode()).await?;
            for action in &rest {
                queue.put(ACTIONS_TOPIC, action.encode()).await?;
            }

            enqueued.fetch_add(count, Ordering::SeqCst);
            *position = next;
            Ok(())
        })
    })
}
