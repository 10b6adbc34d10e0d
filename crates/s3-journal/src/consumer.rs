//! Upload Consumer
//!
//! A single task owns the per-object multipart state and drives every S3
//! mutation. Confining `upload_state` to one task keeps the cross-cutting
//! invariants (contiguous part numbering, last-part handling, descriptor
//! existence) free of locks; throughput is gated by the object store, not
//! by CPU.
//!
//! ## Task lifecycle
//!
//! The consumer pops one task per iteration from the durable queue and
//! dispatches on the decoded [`Action`]:
//!
//! - `Start` initiates a multipart upload, retrying forever at one-second
//!   intervals — nothing can proceed without a descriptor.
//! - `Append` parks the chunk (and the task itself) under its part. The
//!   task is acknowledged later, when the part uploads: the queue entry is
//!   the durable record of the chunk until its bytes are committed.
//! - `Upload` concatenates the parked chunks of a part, uploads them as one
//!   S3 part, then acknowledges every parked task at once.
//! - `End` completes the object once all parts are committed, uploading a
//!   final undersized part first when one remains in the last slot.
//! - `Flush` fans out an `End` for every open object.
//!
//! A task referencing an object with no descriptor is dropped: that upload
//! was abandoned, and retrying could never succeed.
//!
//! ## Recovery
//!
//! On startup the consumer lists in-flight multipart uploads under its
//! prefix, rebuilds their part state, and enqueues an `End` for each so
//! completion resumes. Pending queued chunks are scanned (without being
//! consumed) to pre-acquire admission permits and to find the part-index
//! floor, which rounds up to an object boundary: parts with pending or
//! committed data finish in their existing object, and fresh writes start
//! at the boundary — resuming a recovered object only when it is still
//! empty.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use durable_queue::{DurableQueue, Task};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::position::{object_key, parse_object_key, Action, Position};
use crate::store::{CompletedPart, MultipartDescriptor, MultipartStore, PartLimits, StoreError};
use crate::sweeper::Sweeper;

/// Delay between attempts when the store refuses to make progress.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// How often the expiration sweeper may run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Wake-up interval for the idle loop between tasks.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Identifies one object in `upload_state`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey {
    /// Part index of the first part of the object
    pub first_part: u64,
    pub directory: String,
}

impl ObjectKey {
    fn of(position: &Position, limits: &PartLimits) -> Self {
        Self {
            first_part: position.first_part_of_object(limits),
            directory: position.directory.clone(),
        }
    }
}

/// A chunk parked under its part until the part uploads.
struct PendingChunk {
    /// The queue task acknowledged when the chunk's bytes are committed
    task: Task,
    count: u64,
    payload: Bytes,
}

enum PartState {
    Pending(Vec<PendingChunk>),
    Uploaded { etag: String, part_number: u64 },
}

pub(crate) struct ObjectState {
    descriptor: MultipartDescriptor,
    /// part_index -> state; BTreeMap keeps completion order by part number
    parts: BTreeMap<u64, PartState>,
}

pub(crate) struct Consumer {
    pub queue: Arc<DurableQueue>,
    pub topic: String,
    pub store: Arc<dyn MultipartStore>,
    pub bucket: String,
    pub id: String,
    pub suffix: Option<String>,
    pub list_prefix: String,
    pub limits: PartLimits,
    pub max_queue_size: u64,
    pub semaphore: Arc<Semaphore>,
    pub enqueued: Arc<AtomicU64>,
    pub uploaded: Arc<AtomicU64>,
    pub close_latch: Arc<AtomicBool>,
    pub drain_timeout: Duration,
    pub sweeper: Option<Sweeper>,
    pub upload_state: HashMap<ObjectKey, ObjectState>,
    pub last_sweep: Option<Instant>,
}

impl Consumer {
    /// Rebuild upload state after a restart and return the part index new
    /// writes must start from: the part floor rounded up to an object
    /// boundary.
    pub async fn recover(&mut self) -> Result<u64> {
        let mut highest: Option<u64> = None;

        let uploads = self
            .store
            .list_multipart_uploads(&self.bucket, &self.list_prefix)
            .await?;
        for descriptor in uploads {
            let Some(parsed) = parse_object_key(&descriptor.key) else {
                continue;
            };
            if parsed.id != self.id {
                continue;
            }

            let parts = self.store.list_parts(&descriptor).await?;
            let first_part = parsed.file_number * self.limits.max_parts_per_object;
            let mut object = ObjectState {
                descriptor: descriptor.clone(),
                parts: BTreeMap::new(),
            };
            for part in &parts {
                object.parts.insert(
                    first_part + part.part_number - 1,
                    PartState::Uploaded {
                        etag: part.etag.clone(),
                        part_number: part.part_number,
                    },
                );
            }

            info!(
                key = %descriptor.key,
                upload_id = %descriptor.upload_id,
                committed_parts = parts.len(),
                "recovered in-flight multipart upload"
            );

            let key = ObjectKey {
                first_part,
                directory: parsed.directory.clone(),
            };
            self.upload_state.insert(key, object);

            // An upload with committed parts will be completed by the End
            // below, so its whole object is off-limits: contribute its last
            // slot. An upload with nothing committed contributes only its
            // first part — rounding leaves the floor on it, and fresh
            // writes resume in that same still-empty object
            let contributed = if parts.is_empty() {
                first_part
            } else {
                first_part + self.limits.max_parts_per_object - 1
            };
            highest = highest.max(Some(contributed));

            // Resume completion once any pending parts have drained
            let end = Action::End(Position::new(0, first_part, parsed.directory));
            self.queue.put(&self.topic, end.encode()).await?;
        }

        // Completed objects also raise the floor: a restarted journal must
        // not reuse a file number that already exists in the bucket. A
        // finished object contributes its last slot so rounding lands past it
        let objects = self
            .store
            .list_objects(&self.bucket, &self.list_prefix)
            .await?;
        for key in objects {
            let Some(parsed) = parse_object_key(&key) else {
                continue;
            };
            if parsed.id != self.id {
                continue;
            }
            let first_part = parsed.file_number * self.limits.max_parts_per_object;
            highest = highest.max(Some(first_part + self.limits.max_parts_per_object - 1));
        }

        // Scan pending tasks without consuming them: find the part floor
        // and re-acquire admission permits for records already in flight
        let mut recovered_records = 0u64;
        for task in self.queue.enumerate(&self.topic).await? {
            let Some(Action::Append {
                position, count, ..
            }) = Action::decode(task.payload())
            else {
                continue;
            };

            highest = highest.max(Some(position.part_index));
            if count == 0 {
                continue;
            }

            recovered_records += count;
            match self.semaphore.try_acquire_many(count as u32) {
                Ok(permits) => permits.forget(),
                Err(_) => {
                    return Err(Error::QueueTooSmall {
                        pending: recovered_records,
                        max: self.max_queue_size,
                    })
                }
            }
            self.enqueued.fetch_add(count, Ordering::SeqCst);
        }

        // ceil(highest / max_parts) * max_parts: the next object boundary at
        // or above the floor. When the floor sits exactly on a boundary (a
        // recovered upload with no committed parts), fresh writes continue
        // into that object instead of skipping it
        let max_parts = self.limits.max_parts_per_object;
        let next = match highest {
            Some(h) => ((h + max_parts - 1) / max_parts) * max_parts,
            None => 0,
        };

        info!(
            recovered_records,
            next_part = next,
            open_objects = self.upload_state.len(),
            "recovery complete"
        );
        Ok(next)
    }

    /// The consumer loop. Runs until the close latch is set and the queue
    /// has drained.
    pub async fn run(mut self) {
        loop {
            if let Some(sweeper) = &self.sweeper {
                let due = self
                    .last_sweep
                    .map_or(true, |at| at.elapsed() >= SWEEP_INTERVAL);
                if due {
                    sweeper.sweep(Utc::now()).await;
                    self.last_sweep = Some(Instant::now());
                }
            }

            let task = if self.close_latch.load(Ordering::SeqCst) {
                match self.queue.take_timeout(&self.topic, self.drain_timeout).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        info!("queue exhausted after close, consumer exiting");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "queue take failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
            } else {
                // Bounded even before close so the loop re-checks the latch
                // and the sweeper gate while the queue idles
                match self.queue.take_timeout(&self.topic, IDLE_POLL).await {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "queue take failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
            };

            let action = match Action::decode(task.payload()) {
                Some(action) => action,
                None => {
                    warn!("corrupt task payload, skipping");
                    self.ack(&task).await;
                    continue;
                }
            };

            if let Err(e) = self.dispatch(&task, action).await {
                warn!(error = %e, "task dispatch failed, re-queueing");
                if let Err(e) = self.queue.retry(&task).await {
                    warn!(error = %e, "task retry failed");
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }

    async fn dispatch(&mut self, task: &Task, action: Action) -> Result<()> {
        // Gating: everything except Start and Flush must address an object
        // we hold a descriptor for. Anything else refers to an abandoned
        // upload and is dropped.
        let reference = match &action {
            Action::Append { position, .. } | Action::Upload(position) | Action::End(position) => {
                Some(ObjectKey::of(position, &self.limits))
            }
            _ => None,
        };
        if let Some(key) = reference {
            if !self.upload_state.contains_key(&key) {
                self.drop_for_missing_descriptor(task, &action, &key).await?;
                return Ok(());
            }
        }

        match action {
            Action::Start(position) => {
                let key = ObjectKey::of(&position, &self.limits);
                if !self.upload_state.contains_key(&key) {
                    let object_key = object_key(
                        &position.directory,
                        &self.id,
                        position.file_number(&self.limits),
                        self.suffix.as_deref(),
                    );
                    let descriptor = loop {
                        match self.store.create_multipart(&self.bucket, &object_key).await {
                            Ok(descriptor) => break descriptor,
                            Err(e) => {
                                warn!(key = %object_key, error = %e, "initiate multipart failed, retrying");
                                tokio::time::sleep(RETRY_DELAY).await;
                            }
                        }
                    };
                    info!(key = %object_key, upload_id = %descriptor.upload_id, "multipart upload started");
                    self.upload_state.insert(
                        key,
                        ObjectState {
                            descriptor,
                            parts: BTreeMap::new(),
                        },
                    );
                }
                self.queue.complete(task).await?;
            }

            Action::Append {
                position,
                count,
                payload,
            } => {
                if count == 0 {
                    self.queue.complete(task).await?;
                    return Ok(());
                }
                let key = ObjectKey::of(&position, &self.limits);
                // Gating above guarantees the descriptor exists
                let Some(state) = self.upload_state.get_mut(&key) else {
                    self.queue.complete(task).await?;
                    return Ok(());
                };
                match state
                    .parts
                    .entry(position.part_index)
                    .or_insert_with(|| PartState::Pending(Vec::new()))
                {
                    PartState::Pending(chunks) => {
                        chunks.push(PendingChunk {
                            task: task.clone(),
                            count,
                            payload,
                        });
                        // Not acknowledged yet: the queue entry is the
                        // durable record until the part uploads
                    }
                    PartState::Uploaded { .. } => {
                        // The part was committed before a crash but the
                        // chunk's ack was lost; its bytes are already in S3
                        debug!(
                            part_index = position.part_index,
                            count, "chunk for an already-committed part, acknowledging"
                        );
                        self.semaphore.add_permits(count as usize);
                        self.uploaded.fetch_add(count, Ordering::SeqCst);
                        self.queue.complete(task).await?;
                    }
                }
            }

            Action::Upload(position) => {
                self.flush_part(&position, false).await?;
                self.queue.complete(task).await?;
            }

            Action::End(position) => {
                self.end_object(task, &position).await?;
            }

            Action::Flush => {
                for key in self.upload_state.keys() {
                    let end =
                        Action::End(Position::new(0, key.first_part, key.directory.clone()));
                    self.queue.put(&self.topic, end.encode()).await?;
                }
                self.queue.complete(task).await?;
            }

            Action::Skip => {
                self.queue.complete(task).await?;
            }
        }

        Ok(())
    }

    /// Upload the pending chunks of one part as a single S3 part. A no-op
    /// when the part has already been committed (duplicate upload task
    /// after a crash or retry).
    async fn flush_part(&mut self, position: &Position, last: bool) -> Result<()> {
        let key = ObjectKey::of(position, &self.limits);
        let part_index = position.part_index;

        let (descriptor, payload, part_number) = {
            let Some(state) = self.upload_state.get(&key) else {
                return Ok(());
            };
            let Some(PartState::Pending(chunks)) = state.parts.get(&part_index) else {
                return Ok(());
            };
            let mut payload = BytesMut::new();
            for chunk in chunks {
                payload.extend_from_slice(&chunk.payload);
            }
            (
                state.descriptor.clone(),
                payload.freeze(),
                position.part_number(&self.limits),
            )
        };

        let size = payload.len();
        let etag = self
            .store
            .upload_part(&descriptor, part_number, payload, last)
            .await?;

        // Committed: acknowledge every chunk the part carried
        let Some(state) = self.upload_state.get_mut(&key) else {
            return Ok(());
        };
        let Some(PartState::Pending(chunks)) = state
            .parts
            .insert(part_index, PartState::Uploaded { etag, part_number })
        else {
            return Ok(());
        };

        let mut records = 0u64;
        for chunk in &chunks {
            records += chunk.count;
            self.queue.complete(&chunk.task).await?;
        }
        self.uploaded.fetch_add(records, Ordering::SeqCst);
        self.semaphore.add_permits(records as usize);

        debug!(
            key = %descriptor.key,
            part_number,
            bytes = size,
            records,
            last,
            "part uploaded"
        );
        Ok(())
    }

    async fn end_object(&mut self, task: &Task, position: &Position) -> Result<()> {
        let key = ObjectKey::of(position, &self.limits);
        let (non_uploaded, total_parts) = {
            let Some(state) = self.upload_state.get(&key) else {
                self.queue.complete(task).await?;
                return Ok(());
            };
            let pending: Vec<u64> = state
                .parts
                .iter()
                .filter(|(_, part)| matches!(part, PartState::Pending(_)))
                .map(|(index, _)| *index)
                .collect();
            (pending, state.parts.len() as u64)
        };

        match non_uploaded.as_slice() {
            [] => {
                self.complete_object(&key).await?;
                self.queue.complete(task).await?;
            }
            [remaining]
                if *remaining % self.limits.max_parts_per_object == total_parts - 1 =>
            {
                // The one missing part sits in the object's last slot: it is
                // allowed to be undersized, so push it out and finish
                let final_position = Position::new(0, *remaining, position.directory.clone());
                self.flush_part(&final_position, true).await?;
                self.complete_object(&key).await?;
                self.queue.complete(task).await?;
            }
            _ => {
                // Earlier parts still have upload tasks in flight; let them
                // drain and try again
                debug!(
                    directory = %key.directory,
                    first_part = key.first_part,
                    waiting_on = non_uploaded.len(),
                    "object not ready to complete, re-queueing end"
                );
                self.queue.retry(task).await?;
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Ok(())
    }

    /// Complete (or, for an object that never received data, abort) the
    /// multipart upload and forget the object.
    async fn complete_object(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(state) = self.upload_state.get(key) else {
            return Ok(());
        };

        if state.parts.is_empty() {
            // Nothing was ever uploaded; an empty complete is invalid
            match self.store.abort_multipart(&state.descriptor).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(key = %state.descriptor.key, "empty multipart upload aborted");
        } else {
            let parts: Vec<CompletedPart> = state
                .parts
                .values()
                .filter_map(|part| match part {
                    PartState::Uploaded { etag, part_number } => Some(CompletedPart {
                        part_number: *part_number,
                        etag: etag.clone(),
                    }),
                    PartState::Pending(_) => None,
                })
                .collect();
            self.store
                .complete_multipart(&state.descriptor, &parts)
                .await?;
            info!(
                key = %state.descriptor.key,
                parts = parts.len(),
                "multipart upload completed"
            );
        }

        self.upload_state.remove(key);
        Ok(())
    }

    /// Drop a task addressed at an object we hold no descriptor for.
    ///
    /// Deliberate for `Upload`/`End` after an abort; for a chunk it means
    /// records are lost, which is logged but never retried — a retry could
    /// only spin forever.
    async fn drop_for_missing_descriptor(
        &mut self,
        task: &Task,
        action: &Action,
        key: &ObjectKey,
    ) -> Result<()> {
        if let Action::Append { count, .. } = action {
            if *count > 0 {
                warn!(
                    directory = %key.directory,
                    first_part = key.first_part,
                    records = count,
                    "chunk references an abandoned upload, dropping records"
                );
                // Give the permits back so admission capacity is not lost
                self.semaphore.add_permits(*count as usize);
            }
        } else {
            debug!(
                directory = %key.directory,
                first_part = key.first_part,
                "task references an abandoned upload, dropping"
            );
        }
        self.queue.complete(task).await?;
        Ok(())
    }

    async fn ack(&self, task: &Task) {
        if let Err(e) = self.queue.complete(task).await {
            warn!(error = %e, "task complete failed");
        }
    }
}
