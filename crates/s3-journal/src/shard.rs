//! Sharded Fan-out
//!
//! Runs N independent journals side by side and spreads `put` calls across
//! them round-robin. Each shard owns its slice of everything: a local
//! durable-queue directory (`<base>/<shard_id>`), an object-key prefix
//! (`<shard_id>/...`), and `max_queue_size / N` admission permits. Nothing
//! is ordered across shards.
//!
//! Shard ids are the characters `0-9a-z`, which caps the fan-out at 36.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::config::{DirectoryFormat, JournalConfig, SHARD_IDS};
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalStats};
use crate::store::MultipartStore;

/// Round-robin dispatcher over N independent journals.
pub struct ShardedJournal {
    shards: Vec<Journal>,
    counter: AtomicUsize,
}

impl ShardedJournal {
    /// Open `config.shards` journals, one per shard id.
    pub async fn open(
        config: JournalConfig,
        store: Arc<dyn MultipartStore>,
    ) -> Result<ShardedJournal> {
        Self::open_with_drain_timeout(config, store, Duration::from_secs(5)).await
    }

    /// As [`open`](Self::open), with an explicit consumer drain timeout.
    pub async fn open_with_drain_timeout(
        config: JournalConfig,
        store: Arc<dyn MultipartStore>,
        drain_timeout: Duration,
    ) -> Result<ShardedJournal> {
        config.validate()?;
        let count = config
            .shards
            .ok_or_else(|| Error::Config("shards must be set for a sharded journal".to_string()))?;

        let format = DirectoryFormat::parse(&config.directory_format)?;
        let queue_slice = (config.max_queue_size / count as u64).max(1);

        let mut shards = Vec::with_capacity(count);
        for (index, shard_id) in SHARD_IDS.chars().take(count).enumerate() {
            let shard_config = JournalConfig {
                local_directory: config.local_directory.join(shard_id.to_string()),
                max_queue_size: queue_slice,
                shards: None,
                ..config.clone()
            };

            let journal = Journal::builder(shard_config, store.clone())
                .directory_format(format.with_shard(shard_id))
                .drain_timeout(drain_timeout)
                .open()
                .await?;
            shards.push(journal);

            tracing::debug!(shard = %shard_id, index, "shard opened");
        }

        Ok(ShardedJournal {
            shards,
            counter: AtomicUsize::new(0),
        })
    }

    /// Submit one record to the next shard in rotation.
    pub async fn put(&self, record: impl Into<Bytes>) -> Result<bool> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[index].put(record).await
    }

    /// Numerically merged counters across all shards.
    pub async fn stats(&self) -> Result<JournalStats> {
        let mut merged: Option<JournalStats> = None;
        for shard in &self.shards {
            let stats = shard.stats().await?;
            merged = Some(match merged {
                Some(acc) => acc.merge(&stats),
                None => stats,
            });
        }
        merged.ok_or_else(|| Error::Config("sharded journal has no shards".to_string()))
    }

    /// Close every shard in sequence. All shards are closed even when one
    /// fails; the first error is returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for (index, shard) in self.shards.iter().enumerate() {
            if let Err(e) = shard.close().await {
                warn!(shard = index, error = %e, "shard close failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
