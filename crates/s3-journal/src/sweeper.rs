//! Expiration Sweeper
//!
//! Multipart uploads that were started but never completed keep their parts
//! billed and invisible forever. A crashed peer sharing the bucket leaves
//! exactly that behind. The sweeper reclaims them: it lists every in-flight
//! upload in the bucket, parses the time partition out of each key, and
//! closes uploads older than the configured expiration.
//!
//! Completion is preferred — the data already paid for its upload and
//! becomes readable. When completion is not permitted, the upload is
//! aborted instead. Uploads that vanish mid-sweep (another peer got there
//! first) are ignored.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::DirectoryFormat;
use crate::position::parse_object_key;
use crate::store::{CompletedPart, MultipartStore, StoreError};

pub struct Sweeper {
    pub store: Arc<dyn MultipartStore>,
    pub bucket: String,
    pub format: DirectoryFormat,
    pub expiration: Duration,
}

impl Sweeper {
    /// One sweep over the bucket. Failures are logged, never propagated:
    /// the sweep is housekeeping and must not stall the upload loop.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let uploads = match self.store.list_multipart_uploads(&self.bucket, "").await {
            Ok(uploads) => uploads,
            Err(e) => {
                warn!(error = %e, "listing multipart uploads failed, skipping sweep");
                return;
            }
        };

        debug!(open_uploads = uploads.len(), "expiration sweep started");

        for upload in uploads {
            let Some(parsed) = parse_object_key(&upload.key) else {
                continue;
            };
            let Some(partition_time) = self.format.parse_directory(&parsed.directory) else {
                continue;
            };
            if now - partition_time <= self.expiration {
                continue;
            }

            let parts = match self.store.list_parts(&upload).await {
                Ok(parts) => parts,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(key = %upload.key, error = %e, "listing parts failed");
                    continue;
                }
            };

            if parts.is_empty() {
                // Nothing committed: completion is impossible, abort
                match self.store.abort_multipart(&upload).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {
                        info!(key = %upload.key, "stranded empty upload aborted");
                    }
                    Err(e) => warn!(key = %upload.key, error = %e, "abort failed"),
                }
                continue;
            }

            let mut completed: Vec<CompletedPart> = parts
                .iter()
                .map(|part| CompletedPart {
                    part_number: part.part_number,
                    etag: part.etag.clone(),
                })
                .collect();
            completed.sort_by_key(|part| part.part_number);

            match self.store.complete_multipart(&upload, &completed).await {
                Ok(()) => {
                    info!(
                        key = %upload.key,
                        parts = completed.len(),
                        "stranded upload completed"
                    );
                }
                Err(StoreError::NotFound(_)) => {
                    // Someone else finished or aborted it already
                }
                Err(StoreError::AccessDenied(_)) => {
                    match self.store.abort_multipart(&upload).await {
                        Ok(()) | Err(StoreError::NotFound(_)) => {
                            info!(key = %upload.key, "stranded upload aborted (complete denied)");
                        }
                        Err(e) => {
                            warn!(key = %upload.key, error = %e, "abort after denied complete failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %upload.key, error = %e, "failed to reclaim stranded upload");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMultipartStore;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn sweeper(store: Arc<InMemoryMultipartStore>, expiration_days: i64) -> Sweeper {
        Sweeper {
            store,
            bucket: "bucket".to_string(),
            format: DirectoryFormat::parse("%Y/%m/%d").unwrap(),
            expiration: Duration::days(expiration_days),
        }
    }

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn test_expired_upload_with_parts_is_completed() {
        let store = Arc::new(InMemoryMultipartStore::new());
        let descriptor = store
            .create_multipart("bucket", "2024/01/01/host-000000.journal")
            .await
            .unwrap();
        store
            .upload_part(&descriptor, 1, Bytes::from("stranded"), true)
            .await
            .unwrap();

        // 30 days later, with a 7 day expiration
        sweeper(store.clone(), 7).sweep(at(2024, 1, 31)).await;

        assert_eq!(store.open_upload_count().await, 0);
        assert_eq!(
            store.object("2024/01/01/host-000000.journal").await,
            Some(Bytes::from("stranded"))
        );
    }

    #[tokio::test]
    async fn test_expired_empty_upload_is_aborted() {
        let store = Arc::new(InMemoryMultipartStore::new());
        store
            .create_multipart("bucket", "2024/01/01/host-000000.journal")
            .await
            .unwrap();

        sweeper(store.clone(), 7).sweep(at(2024, 1, 31)).await;

        assert_eq!(store.open_upload_count().await, 0);
        assert!(store
            .object("2024/01/01/host-000000.journal")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_fresh_uploads_untouched() {
        let store = Arc::new(InMemoryMultipartStore::new());
        store
            .create_multipart("bucket", "2024/01/29/host-000000.journal")
            .await
            .unwrap();

        sweeper(store.clone(), 7).sweep(at(2024, 1, 31)).await;

        assert_eq!(store.open_upload_count().await, 1, "2 days old, expiration 7 days");
    }

    #[tokio::test]
    async fn test_unparseable_keys_ignored() {
        let store = Arc::new(InMemoryMultipartStore::new());
        store
            .create_multipart("bucket", "something/else.bin")
            .await
            .unwrap();
        store
            .create_multipart("bucket", "not-a-date/host-000000.journal")
            .await
            .unwrap();

        sweeper(store.clone(), 7).sweep(at(2024, 1, 31)).await;

        assert_eq!(store.open_upload_count().await, 2);
    }

    #[tokio::test]
    async fn test_sweep_parses_foreign_shard_prefixes() {
        let store = Arc::new(InMemoryMultipartStore::new());
        let descriptor = store
            .create_multipart("bucket", "7/2024/01/01/other-host-000000.journal")
            .await
            .unwrap();
        store
            .upload_part(&descriptor, 1, Bytes::from("x"), true)
            .await
            .unwrap();

        sweeper(store.clone(), 7).sweep(at(2024, 1, 31)).await;

        assert_eq!(
            store.open_upload_count().await,
            0,
            "shard-prefixed key from a peer should still be reclaimed"
        );
    }
}
