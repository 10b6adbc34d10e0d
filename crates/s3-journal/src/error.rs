//! Journal Error Types
//!
//! All journal operations return `Result<T>`, aliased to
//! `Result<T, Error>`, so errors propagate cleanly with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("journal is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("queue size too small for recovered workload: {pending} pending records exceed max_queue_size {max}")]
    QueueTooSmall { pending: u64, max: u64 },

    #[error("durable queue error: {0}")]
    Queue(#[from] durable_queue::Error),

    #[error("object store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
