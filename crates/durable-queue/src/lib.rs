//! Durable Task Queue
//!
//! A crash-safe, file-backed FIFO of opaque tasks. Producers append task
//! payloads with [`DurableQueue::put`]; a consumer pops them with
//! [`DurableQueue::take`], then either acknowledges ([`DurableQueue::complete`])
//! or re-delivers ([`DurableQueue::retry`]) each task. Tasks survive process
//! crashes: anything appended but not yet completed is re-delivered after a
//! restart from the same directory.
//!
//! ## File Format
//!
//! Each topic owns two append-only files inside the queue directory:
//!
//! ```text
//! <topic>.log     task records, in enqueue order
//! <topic>.ack     ids of completed tasks
//! ```
//!
//! Log record layout (all integers little-endian):
//!
//! ```text
//! ┌───────────┬──────────┬──────────┬──────────┐
//! │ Length    │ CRC32    │ Task Id  │ Payload  │
//! │ (4 bytes) │(4 bytes) │(8 bytes) │(N bytes) │
//! └───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Ack record layout:
//!
//! ```text
//! ┌──────────┬──────────┐
//! │ Task Id  │ CRC32    │
//! │(8 bytes) │(4 bytes) │
//! └──────────┴──────────┘
//! ```
//!
//! On open, the log is scanned and every task without a matching ack becomes
//! pending again, in original order. A CRC mismatch or a partial record stops
//! the scan at the damaged tail with a warning; everything before it is kept.
//! Once no task is pending or in flight, both files are truncated so the
//! directory does not grow without bound.
//!
//! ## Usage
//!
//! ```ignore
//! use durable_queue::{DurableQueue, QueueConfig};
//!
//! let queue = DurableQueue::open(QueueConfig {
//!     directory: "./data/queue".into(),
//!     fsync: true,
//! }).await?;
//!
//! queue.put("uploads", Bytes::from("work")).await?;
//!
//! let task = queue.take("uploads").await?;
//! // ... do the work ...
//! queue.complete(&task).await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid topic name: {0}")]
    InvalidTopic(String),
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory holding the per-topic log and ack files
    pub directory: PathBuf,

    /// Fsync after every put and complete (default: true)
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

fn default_fsync() -> bool {
    true
}

/// One queued task.
///
/// A `Task` is a handle: it can be held long after it was taken and passed
/// back to [`DurableQueue::complete`] or [`DurableQueue::retry`] at any time.
#[derive(Debug, Clone)]
pub struct Task {
    id: u64,
    topic: Arc<str>,
    payload: Bytes,
}

impl Task {
    /// The task payload as appended by `put`.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Topic this task belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Counters for one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks currently waiting to be taken
    pub pending: u64,
    /// Tasks taken but neither completed nor retried
    pub in_progress: u64,
    /// Tasks appended since this queue was opened
    pub enqueued: u64,
    /// Tasks acknowledged since this queue was opened
    pub completed: u64,
    /// Re-deliveries since this queue was opened
    pub retried: u64,
}

impl QueueStats {
    /// Field-wise sum, used when merging stats across queues.
    pub fn merge(&self, other: &QueueStats) -> QueueStats {
        QueueStats {
            pending: self.pending + other.pending,
            in_progress: self.in_progress + other.in_progress,
            enqueued: self.enqueued + other.enqueued,
            completed: self.completed + other.completed,
            retried: self.retried + other.retried,
        }
    }
}

/// Crash-safe FIFO of opaque tasks, partitioned by topic.
pub struct DurableQueue {
    config: QueueConfig,
    topics: RwLock<HashMap<String, Arc<TopicQueue>>>,
}

struct TopicQueue {
    name: Arc<str>,
    state: Mutex<TopicState>,
    notify: Notify,
}

struct TopicState {
    log: File,
    ack: File,
    next_id: u64,
    pending: VecDeque<Task>,
    in_progress: HashSet<u64>,
    stats: QueueStats,
}

impl DurableQueue {
    /// Open a queue rooted at `config.directory`, creating it if missing.
    ///
    /// Topic files are loaded lazily on first access, so opening is cheap
    /// even for directories with many topics.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;
        info!(directory = ?config.directory, fsync = config.fsync, "durable queue opened");

        Ok(Self {
            config,
            topics: RwLock::new(HashMap::new()),
        })
    }

    /// Durably append a task payload to `topic`.
    pub async fn put(&self, topic: &str, payload: Bytes) -> Result<()> {
        let queue = self.topic(topic).await?;
        let mut state = queue.state.lock().await;

        let id = state.next_id;
        state.next_id += 1;

        let mut record = Vec::with_capacity(16 + payload.len());
        record.extend_from_slice(&((8 + payload.len()) as u32).to_le_bytes());

        let mut crc = crc32fast::Hasher::new();
        crc.update(&id.to_le_bytes());
        crc.update(&payload);
        record.extend_from_slice(&crc.finalize().to_le_bytes());
        record.extend_from_slice(&id.to_le_bytes());
        record.extend_from_slice(&payload);

        state.log.write_all(&record).await?;
        if self.config.fsync {
            state.log.sync_data().await?;
        }

        state.pending.push_back(Task {
            id,
            topic: queue.name.clone(),
            payload,
        });
        state.stats.enqueued += 1;
        drop(state);

        queue.notify.notify_one();
        Ok(())
    }

    /// Pop the next task from `topic`, waiting until one is available.
    pub async fn take(&self, topic: &str) -> Result<Task> {
        let queue = self.topic(topic).await?;
        loop {
            let notified = queue.notify.notified();
            {
                let mut state = queue.state.lock().await;
                if let Some(task) = state.pending.pop_front() {
                    state.in_progress.insert(task.id);
                    return Ok(task);
                }
            }
            notified.await;
        }
    }

    /// Pop the next task from `topic`, or return `None` after `timeout`.
    pub async fn take_timeout(&self, topic: &str, timeout: Duration) -> Result<Option<Task>> {
        match tokio::time::timeout(timeout, self.take(topic)).await {
            Ok(task) => task.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Acknowledge a task, removing it from the queue permanently.
    ///
    /// Completing a task that is not in flight is a no-op: the consumer's
    /// error path may race a completion that already happened.
    pub async fn complete(&self, task: &Task) -> Result<()> {
        let queue = self.topic(&task.topic).await?;
        let mut state = queue.state.lock().await;

        if !state.in_progress.remove(&task.id) {
            debug!(topic = %task.topic, id = task.id, "complete on task not in flight, ignoring");
            return Ok(());
        }

        let mut record = [0u8; 12];
        record[..8].copy_from_slice(&task.id.to_le_bytes());
        let mut crc = crc32fast::Hasher::new();
        crc.update(&task.id.to_le_bytes());
        record[8..].copy_from_slice(&crc.finalize().to_le_bytes());

        state.ack.write_all(&record).await?;
        if self.config.fsync {
            state.ack.sync_data().await?;
        }
        state.stats.completed += 1;

        if state.pending.is_empty() && state.in_progress.is_empty() {
            Self::truncate(&mut state).await?;
            debug!(topic = %task.topic, "queue quiescent, files truncated");
        }

        Ok(())
    }

    /// Return a task to the queue for later re-delivery.
    ///
    /// Like [`complete`](Self::complete), retrying a task that is not in
    /// flight is a no-op.
    pub async fn retry(&self, task: &Task) -> Result<()> {
        let queue = self.topic(&task.topic).await?;
        let mut state = queue.state.lock().await;

        if !state.in_progress.remove(&task.id) {
            debug!(topic = %task.topic, id = task.id, "retry on task not in flight, ignoring");
            return Ok(());
        }

        state.pending.push_back(task.clone());
        state.stats.retried += 1;
        drop(state);

        queue.notify.notify_one();
        Ok(())
    }

    /// Snapshot the pending tasks of `topic` without consuming them.
    ///
    /// Every returned task remains deliverable through [`take`](Self::take).
    pub async fn enumerate(&self, topic: &str) -> Result<Vec<Task>> {
        let queue = self.topic(topic).await?;
        let state = queue.state.lock().await;
        Ok(state.pending.iter().cloned().collect())
    }

    /// Current counters for `topic`.
    pub async fn stats(&self, topic: &str) -> Result<QueueStats> {
        let queue = self.topic(topic).await?;
        let state = queue.state.lock().await;
        let mut stats = state.stats;
        stats.pending = state.pending.len() as u64;
        stats.in_progress = state.in_progress.len() as u64;
        Ok(stats)
    }

    async fn topic(&self, name: &str) -> Result<Arc<TopicQueue>> {
        // Fast path: topic already loaded
        {
            let topics = self.topics.read().await;
            if let Some(queue) = topics.get(name) {
                return Ok(queue.clone());
            }
        }

        let mut topics = self.topics.write().await;
        if let Some(queue) = topics.get(name) {
            return Ok(queue.clone());
        }

        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(Error::InvalidTopic(name.to_string()));
        }

        let queue = Arc::new(self.load_topic(name).await?);
        topics.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Open the topic's files and rebuild pending state from them.
    async fn load_topic(&self, name: &str) -> Result<TopicQueue> {
        let log_path = self.config.directory.join(format!("{name}.log"));
        let ack_path = self.config.directory.join(format!("{name}.ack"));

        let topic: Arc<str> = Arc::from(name);
        let acked = Self::scan_acks(&ack_path).await?;
        let (pending, next_id) = Self::scan_log(&log_path, &topic, &acked).await?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let ack = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ack_path)
            .await?;

        info!(
            topic = name,
            pending = pending.len(),
            next_id,
            "topic loaded"
        );

        Ok(TopicQueue {
            name: topic,
            state: Mutex::new(TopicState {
                log,
                ack,
                next_id,
                pending,
                in_progress: HashSet::new(),
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
        })
    }

    async fn scan_acks(path: &PathBuf) -> Result<HashSet<u64>> {
        let mut acked = HashSet::new();
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(acked),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut record = [0u8; 12];
        loop {
            match reader.read_exact(&mut record).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let id = u64::from_le_bytes([
                record[0], record[1], record[2], record[3], record[4], record[5], record[6],
                record[7],
            ]);
            let stored_crc =
                u32::from_le_bytes([record[8], record[9], record[10], record[11]]);

            let mut crc = crc32fast::Hasher::new();
            crc.update(&id.to_le_bytes());
            if crc.finalize() != stored_crc {
                warn!(path = ?path, "corrupt ack record, stopping ack scan");
                break;
            }
            acked.insert(id);
        }

        Ok(acked)
    }

    async fn scan_log(
        path: &PathBuf,
        topic: &Arc<str>,
        acked: &HashSet<u64>,
    ) -> Result<(VecDeque<Task>, u64)> {
        let mut pending = VecDeque::new();
        let mut next_id = 0u64;

        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((pending, next_id)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        loop {
            let mut header = [0u8; 8];
            match reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len < 8 {
                warn!(path = ?path, "corrupt log record length, stopping log scan");
                break;
            }

            let mut body = vec![0u8; len];
            match reader.read_exact(&mut body).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(path = ?path, "partial record at end of log, stopping log scan");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let mut crc = crc32fast::Hasher::new();
            crc.update(&body);
            if crc.finalize() != stored_crc {
                warn!(path = ?path, "corrupt log record, stopping log scan");
                break;
            }

            let id = u64::from_le_bytes([
                body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
            ]);
            next_id = next_id.max(id + 1);

            if !acked.contains(&id) {
                pending.push_back(Task {
                    id,
                    topic: topic.clone(),
                    payload: Bytes::from(body.split_off(8)),
                });
            }
        }

        Ok((pending, next_id))
    }

    async fn truncate(state: &mut TopicState) -> Result<()> {
        state.log.seek(SeekFrom::Start(0)).await?;
        state.log.set_len(0).await?;
        state.log.sync_all().await?;
        state.ack.seek(SeekFrom::Start(0)).await?;
        state.ack.set_len(0).await?;
        state.ack.sync_all().await?;
        state.next_id = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> QueueConfig {
        QueueConfig {
            directory: dir.path().to_path_buf(),
            fsync: true,
        }
    }

    #[tokio::test]
    async fn test_put_take_complete() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        queue.put("work", Bytes::from("a")).await.unwrap();
        queue.put("work", Bytes::from("b")).await.unwrap();

        let t1 = queue.take("work").await.unwrap();
        assert_eq!(t1.payload(), &Bytes::from("a"));
        let t2 = queue.take("work").await.unwrap();
        assert_eq!(t2.payload(), &Bytes::from("b"));

        queue.complete(&t1).await.unwrap();
        queue.complete(&t2).await.unwrap();

        let stats = queue.stats("work").await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn test_take_timeout_empty() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        let taken = queue
            .take_timeout("work", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn test_retry_redelivers() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        queue.put("work", Bytes::from("a")).await.unwrap();
        queue.put("work", Bytes::from("b")).await.unwrap();

        let t1 = queue.take("work").await.unwrap();
        queue.retry(&t1).await.unwrap();

        // "a" was pushed to the back: "b" comes first now
        let t2 = queue.take("work").await.unwrap();
        assert_eq!(t2.payload(), &Bytes::from("b"));
        let t1_again = queue.take("work").await.unwrap();
        assert_eq!(t1_again.payload(), &Bytes::from("a"));

        let stats = queue.stats("work").await.unwrap();
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test]
    async fn test_enumerate_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        queue.put("work", Bytes::from("a")).await.unwrap();
        queue.put("work", Bytes::from("b")).await.unwrap();

        let snapshot = queue.enumerate("work").await.unwrap();
        assert_eq!(snapshot.len(), 2);

        // Both tasks are still deliverable
        let t1 = queue.take("work").await.unwrap();
        let t2 = queue.take("work").await.unwrap();
        assert_eq!(t1.payload(), &Bytes::from("a"));
        assert_eq!(t2.payload(), &Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_crash_recovery_redelivers_unacked() {
        let dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(config(&dir)).await.unwrap();
            queue.put("work", Bytes::from("a")).await.unwrap();
            queue.put("work", Bytes::from("b")).await.unwrap();
            queue.put("work", Bytes::from("c")).await.unwrap();

            let t1 = queue.take("work").await.unwrap();
            queue.complete(&t1).await.unwrap();

            // Crash: "b" and "c" never completed
        }

        let queue = DurableQueue::open(config(&dir)).await.unwrap();
        let stats = queue.stats("work").await.unwrap();
        assert_eq!(stats.pending, 2);

        let t2 = queue.take("work").await.unwrap();
        assert_eq!(t2.payload(), &Bytes::from("b"));
        let t3 = queue.take("work").await.unwrap();
        assert_eq!(t3.payload(), &Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_in_flight_tasks_redelivered_after_crash() {
        let dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(config(&dir)).await.unwrap();
            queue.put("work", Bytes::from("a")).await.unwrap();
            // Taken but never acked: still durable
            let _task = queue.take("work").await.unwrap();
        }

        let queue = DurableQueue::open(config(&dir)).await.unwrap();
        let task = queue.take("work").await.unwrap();
        assert_eq!(task.payload(), &Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_truncate_when_quiescent() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        for i in 0..10 {
            queue
                .put("work", Bytes::from(format!("task-{i}")))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            let task = queue.take("work").await.unwrap();
            queue.complete(&task).await.unwrap();
        }

        let log_len = std::fs::metadata(dir.path().join("work.log"))
            .unwrap()
            .len();
        let ack_len = std::fs::metadata(dir.path().join("work.ack"))
            .unwrap()
            .len();
        assert_eq!(log_len, 0, "log truncated once quiescent");
        assert_eq!(ack_len, 0, "ack truncated once quiescent");
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_skipped() {
        let dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(config(&dir)).await.unwrap();
            queue.put("work", Bytes::from("good")).await.unwrap();
        }

        // Append garbage to simulate a torn write at the tail
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("work.log"))
            .unwrap();
        file.write_all(&[0xFF, 0x13, 0x00, 0x00, 0xAB]).unwrap();

        let queue = DurableQueue::open(config(&dir)).await.unwrap();
        let stats = queue.stats("work").await.unwrap();
        assert_eq!(stats.pending, 1, "intact prefix recovered");

        let task = queue.take("work").await.unwrap();
        assert_eq!(task.payload(), &Bytes::from("good"));
    }

    #[tokio::test]
    async fn test_complete_not_in_flight_is_noop() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        queue.put("work", Bytes::from("a")).await.unwrap();
        let task = queue.take("work").await.unwrap();
        queue.complete(&task).await.unwrap();

        // Double complete and a late retry are both ignored
        queue.complete(&task).await.unwrap();
        queue.retry(&task).await.unwrap();

        let stats = queue.stats("work").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        queue.put("alpha", Bytes::from("a")).await.unwrap();
        queue.put("beta", Bytes::from("b")).await.unwrap();

        let a = queue.take("alpha").await.unwrap();
        assert_eq!(a.payload(), &Bytes::from("a"));
        assert_eq!(queue.stats("beta").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(config(&dir)).await.unwrap();

        assert!(queue.put("../evil", Bytes::from("x")).await.is_err());
        assert!(queue.put("", Bytes::from("x")).await.is_err());
    }
}
