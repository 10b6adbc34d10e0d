//! Multipart Object Store Interface
//!
//! The journal never talks to S3 directly; it drives this trait. The trait
//! deliberately exposes the raw multipart operations (initiate, per-part
//! upload, complete, abort) plus the listing calls recovery and the
//! expiration sweeper need, rather than a whole-object `put`: the journal's
//! whole point is streaming parts of an object that is still growing.
//!
//! ## Implementations
//!
//! Production deployments implement this over an S3 SDK; the crate ships
//! [`InMemoryMultipartStore`], a faithful in-memory model used by every test
//! (contiguity of part numbers is enforced at complete time, the way S3
//! enforces it).
//!
//! ## Part-size rules
//!
//! The S3 conventional limits live here as constants. Tests shrink them via
//! [`PartLimits`], which the journal threads through its position arithmetic
//! and consumer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Minimum size of every part except the last one of an object (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum size of a single part (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS_PER_OBJECT: u64 = 10_000;

/// Part-size rules the journal must respect.
///
/// Defaults to the S3 conventional values; tests shrink them to exercise
/// part and object rollover without gigabytes of data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartLimits {
    /// A part is flushed once it exceeds this many bytes
    pub min_part_size: u64,
    /// Hard upper bound on a single part
    pub max_part_size: u64,
    /// Parts per object before rolling over to a new object
    pub max_parts_per_object: u64,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_parts_per_object: MAX_PARTS_PER_OBJECT,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a [`MultipartStore`].
///
/// The sweeper's reclamation policy branches on the kind: `NotFound` means
/// someone else already finished or aborted the upload, `AccessDenied` means
/// we may abort but not complete.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("object store error: {0}")]
    Other(String),
}

/// Identifies one in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartDescriptor {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part the store has already committed for an upload.
#[derive(Debug, Clone)]
pub struct UploadedPart {
    /// 1-based part number within the object
    pub part_number: u64,
    pub etag: String,
    pub size: u64,
}

/// ETag list entry passed to [`MultipartStore::complete_multipart`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u64,
    pub etag: String,
}

/// The object-store operations the journal consumes.
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Initiate a multipart upload for `key`, returning its descriptor.
    async fn create_multipart(&self, bucket: &str, key: &str)
        -> StoreResult<MultipartDescriptor>;

    /// Upload one part. `last` marks the final part of the object, which is
    /// allowed to be smaller than the minimum part size. Returns the ETag.
    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: u64,
        data: Bytes,
        last: bool,
    ) -> StoreResult<String>;

    /// Complete an upload from its ETag list. Part numbers must be
    /// contiguous starting at 1.
    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    /// Abort an upload, discarding its committed parts.
    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> StoreResult<()>;

    /// List in-flight multipart uploads whose key starts with `prefix`.
    /// An empty prefix lists the whole bucket.
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<MultipartDescriptor>>;

    /// List the parts already committed for an upload.
    async fn list_parts(&self, descriptor: &MultipartDescriptor)
        -> StoreResult<Vec<UploadedPart>>;

    /// List completed object keys starting with `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;
}

/// In-memory [`MultipartStore`] used by tests.
///
/// Models the parts of S3 semantics the journal depends on: uploads are
/// invisible until completed, part numbers must be contiguous at complete
/// time, and aborted uploads disappear. Injected failures let tests exercise
/// the consumer's retry paths.
#[derive(Default)]
pub struct InMemoryMultipartStore {
    inner: Mutex<StoreInner>,
    /// Fail the next N `upload_part` calls with a transient error
    fail_uploads: AtomicU32,
    /// Fail the next N `complete_multipart` calls with a transient error
    fail_completes: AtomicU32,
}

#[derive(Default)]
struct StoreInner {
    /// upload_id -> in-flight upload
    uploads: HashMap<String, UploadRecord>,
    /// completed key -> body
    objects: BTreeMap<String, Bytes>,
    /// completed key -> size of each part, in part-number order
    part_sizes: HashMap<String, Vec<u64>>,
}

struct UploadRecord {
    bucket: String,
    key: String,
    /// part_number -> (etag, body)
    parts: BTreeMap<u64, (String, Bytes)>,
}

impl InMemoryMultipartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` part uploads fail with a transient error.
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` completes fail with a transient error.
    pub fn fail_next_completes(&self, n: u32) {
        self.fail_completes.store(n, Ordering::SeqCst);
    }

    /// Body of a completed object, if present.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().await.objects.get(key).cloned()
    }

    /// Keys of all completed objects, sorted.
    pub async fn object_keys(&self) -> Vec<String> {
        self.inner.lock().await.objects.keys().cloned().collect()
    }

    /// Number of uploads initiated but not yet completed or aborted.
    pub async fn open_upload_count(&self) -> usize {
        self.inner.lock().await.uploads.len()
    }

    /// Sizes of the parts a completed object was assembled from, in
    /// part-number order.
    pub async fn completed_part_sizes(&self, key: &str) -> Option<Vec<u64>> {
        self.inner.lock().await.part_sizes.get(key).cloned()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MultipartStore for InMemoryMultipartStore {
    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<MultipartDescriptor> {
        let upload_id = Uuid::new_v4().to_string();
        let descriptor = MultipartDescriptor {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
        };
        self.inner.lock().await.uploads.insert(
            upload_id,
            UploadRecord {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(descriptor)
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: u64,
        data: Bytes,
        _last: bool,
    ) -> StoreResult<String> {
        if Self::take_failure(&self.fail_uploads) {
            return Err(StoreError::Other("injected upload failure".to_string()));
        }

        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get_mut(&descriptor.upload_id)
            .ok_or_else(|| StoreError::NotFound(descriptor.upload_id.clone()))?;

        let etag = format!("etag-{}-{}", part_number, data.len());
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        if Self::take_failure(&self.fail_completes) {
            return Err(StoreError::Other("injected complete failure".to_string()));
        }

        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get(&descriptor.upload_id)
            .ok_or_else(|| StoreError::NotFound(descriptor.upload_id.clone()))?;

        if parts.is_empty() {
            return Err(StoreError::Other(
                "cannot complete a multipart upload with no parts".to_string(),
            ));
        }

        let mut body = Vec::new();
        let mut sizes = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != i as u64 + 1 {
                return Err(StoreError::Other(format!(
                    "non-contiguous part numbers: expected {}, got {}",
                    i + 1,
                    part.part_number
                )));
            }
            let (etag, data) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::NotFound(format!("part {}", part.part_number)))?;
            if etag != &part.etag {
                return Err(StoreError::Other(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            body.extend_from_slice(data);
            sizes.push(data.len() as u64);
        }

        let key = upload.key.clone();
        inner.uploads.remove(&descriptor.upload_id);
        inner.objects.insert(key.clone(), Bytes::from(body));
        inner.part_sizes.insert(key, sizes);
        Ok(())
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .uploads
            .remove(&descriptor.upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(descriptor.upload_id.clone()))
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<MultipartDescriptor>> {
        let inner = self.inner.lock().await;
        let mut uploads: Vec<_> = inner
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket && u.key.starts_with(prefix))
            .map(|(id, u)| MultipartDescriptor {
                bucket: u.bucket.clone(),
                key: u.key.clone(),
                upload_id: id.clone(),
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(uploads)
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> StoreResult<Vec<UploadedPart>> {
        let inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get(&descriptor.upload_id)
            .ok_or_else(|| StoreError::NotFound(descriptor.upload_id.clone()))?;

        Ok(upload
            .parts
            .iter()
            .map(|(number, (etag, data))| UploadedPart {
                part_number: *number,
                etag: etag.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn list_objects(&self, _bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
