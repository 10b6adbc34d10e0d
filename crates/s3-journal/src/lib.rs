//! S3 Journal
//!
//! A reliable, high-throughput journal to an S3-compatible object store.
//! Producers submit discrete records; the journal batches, optionally
//! compresses, and streams them to time-partitioned objects using the
//! multipart upload API — surviving process crashes without data loss and
//! without violating the store's part-size rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐
//! │ Producers │  put(record) — non-blocking admission
//! └─────┬─────┘
//!       ▼
//! ┌───────────────┐
//! │ Batcher       │  size/time bounded, in-memory
//! └─────┬─────────┘
//!       │ flush: frame + compress + advance position
//!       ▼
//! ┌───────────────┐
//! │ Durable queue │  crash-safe spill of upload actions
//! └─────┬─────────┘
//!       │ take, one at a time
//!       ▼
//! ┌───────────────┐
//! │ Consumer      │  single-task multipart upload state machine
//! └─────┬─────────┘
//!       ▼
//! ┌───────────────────────────────────────────────┐
//! │ S3    <dir>/<id>-<n>.journal[.<suffix>]       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Every record accepted into a flushed batch is durable on local disk
//!   before upload, and is uploaded exactly once — a crash and restart with
//!   the same `local_directory` resumes where it left off.
//! - Parts respect the store's minimum/maximum part sizes; objects roll
//!   over after `max_parts_per_object` parts and on time-partition change.
//! - Admission is released on S3 acknowledgment, giving end-to-end
//!   backpressure when the store falls behind.
//!
//! ## Usage
//!
//! ```ignore
//! use s3_journal::{Journal, JournalConfig};
//!
//! let config = JournalConfig {
//!     bucket: "events".to_string(),
//!     local_directory: "./data/journal".into(),
//!     max_batch_size: Some(1024),
//!     ..Default::default()
//! };
//!
//! let journal = Journal::open(config, store).await?;
//!
//! if !journal.put("hello world").await? {
//!     // journal full: uploads are behind, shed or retry
//! }
//!
//! journal.close().await?;
//! ```

pub mod batcher;
pub mod config;
mod consumer;
pub mod error;
pub mod frame;
pub mod journal;
pub mod position;
pub mod shard;
pub mod store;
pub mod sweeper;

pub use config::{DirectoryFormat, JournalConfig, SHARD_IDS};
pub use error::{Error, Result};
pub use frame::{Compression, Framer};
pub use journal::{ClockFn, Journal, JournalBuilder, JournalStats};
pub use position::{advance, object_key, parse_object_key, Action, ParsedKey, Position};
pub use shard::ShardedJournal;
pub use store::{
    CompletedPart, InMemoryMultipartStore, MultipartDescriptor, MultipartStore, PartLimits,
    StoreError, UploadedPart, MAX_PARTS_PER_OBJECT, MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use sweeper::Sweeper;
