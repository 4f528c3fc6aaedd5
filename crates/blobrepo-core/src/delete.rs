//! Batched deletion with partial-failure reconciliation.
//!
//! The provider accepts at most [`MAX_BULK_DELETES`] keys per bulk delete.
//! [`BulkDeleteCoordinator`] groups keys in arrival order into batches of that
//! size, sends each batch in quiet mode, and tracks which keys remain
//! outstanding:
//!
//! - keys reported as failed stay outstanding, except `NoSuchKey` failures,
//!   which count as deleted;
//! - when a whole batch fails, every key of the batch stays outstanding.
//!
//! The operation only fails if keys are still outstanding once every batch
//! was sent. The first batch failure becomes the error's primary cause and
//! later ones are kept as suppressed causes.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    client::ObjectClient,
    config::MAX_BULK_DELETES,
    error::{BatchDeleteError, BlobStoreError, BlobStoreResult, DeleteFailure, SuppressedErrors},
};

/// Outstanding keys named in a delete error.
pub const MAX_REPORTED_KEYS: usize = 10;

/// Totals accumulated across one delete operation.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Keys acknowledged as deleted (or already absent).
    pub deleted_count: u64,
    /// Sum of the sizes enqueued with the acknowledged keys.
    pub deleted_bytes: u64,
    /// Keys not deleted after every batch was sent.
    pub outstanding: BTreeSet<String>,
    /// Every batch failure observed, first one primary.
    pub last_error: Option<SuppressedErrors<BatchDeleteError>>,
}

/// Splits deletes into provider-sized batches and reconciles failures.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobrepo_core::{BulkDeleteCoordinator, InMemoryObjectClient};
/// use bytes::Bytes;
///
/// tokio_test::block_on(async {
///     let client = Arc::new(InMemoryObjectClient::new("bucket"));
///     client.insert("a", Bytes::from_static(b"1"));
///     client.insert("b", Bytes::from_static(b"22"));
///
///     let mut deletes = BulkDeleteCoordinator::new(client.clone(), 1000);
///     deletes.enqueue("a", 1).await;
///     deletes.enqueue("b", 2).await;
///     let outcome = deletes.finish().await.unwrap();
///     assert_eq!(outcome.deleted_count, 2);
///     assert_eq!(outcome.deleted_bytes, 3);
///     assert_eq!(client.object_count(), 0);
/// });
/// ```
pub struct BulkDeleteCoordinator {
    client: Arc<dyn ObjectClient>,
    batch_size: usize,
    pending: Vec<(String, u64)>,
    outcome: DeleteOutcome,
}

impl fmt::Debug for BulkDeleteCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDeleteCoordinator")
            .field("bucket", &self.client.bucket())
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl BulkDeleteCoordinator {
    /// Create a coordinator sending at most `batch_size` keys per call.
    ///
    /// `batch_size` is clamped to `[1, MAX_BULK_DELETES]`.
    #[must_use]
    pub fn new(client: Arc<dyn ObjectClient>, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, MAX_BULK_DELETES);
        Self {
            client,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            outcome: DeleteOutcome::default(),
        }
    }

    /// Queue `key` (of `size` bytes) for deletion, sending a batch once full.
    pub async fn enqueue(&mut self, key: impl Into<String>, size: u64) {
        self.pending.push((key.into(), size));
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Send the queued keys, if any, as one batch.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        self.delete_batch(batch).await;
    }

    /// Keys not deleted so far.
    #[must_use]
    pub fn outstanding(&self) -> &BTreeSet<String> {
        &self.outcome.outstanding
    }

    /// Send the remaining keys and report the result.
    ///
    /// Fails with [`BlobStoreError::Delete`] when any key is outstanding.
    pub async fn finish(mut self) -> BlobStoreResult<DeleteOutcome> {
        self.flush().await;
        let mut outcome = self.outcome;
        if outcome.outstanding.is_empty() {
            if outcome.last_error.is_some() {
                debug!(
                    deleted = outcome.deleted_count,
                    "bulk delete recovered from earlier batch failures"
                );
            }
            return Ok(outcome);
        }

        let sample: Vec<String> = outcome
            .outstanding
            .iter()
            .take(MAX_REPORTED_KEYS)
            .cloned()
            .collect();
        match outcome.last_error.take() {
            Some(source) => Err(BlobStoreError::Delete {
                sample,
                outstanding: outcome.outstanding.len(),
                source,
            }),
            None => Err(BlobStoreError::illegal_state(format!(
                "keys {sample:?} outstanding without a recorded failure"
            ))),
        }
    }

    async fn delete_batch(&mut self, batch: Vec<(String, u64)>) {
        let keys: Vec<String> = batch.iter().map(|(key, _)| key.clone()).collect();
        match self.client.delete_objects(&keys, true).await {
            Ok(failures) => {
                let (missing, failures): (Vec<DeleteFailure>, Vec<DeleteFailure>) =
                    failures.into_iter().partition(DeleteFailure::is_missing_key);
                let failed: HashSet<&str> = failures.iter().map(|f| f.key.as_str()).collect();
                for (key, size) in batch {
                    if failed.contains(key.as_str()) {
                        self.outcome.outstanding.insert(key);
                    } else {
                        self.acknowledge(&key, size);
                    }
                }
                if !missing.is_empty() {
                    debug!(count = missing.len(), "bulk delete skipped missing keys");
                }
                if !failures.is_empty() {
                    let rendered: Vec<String> = failures.iter().map(ToString::to_string).collect();
                    warn!(
                        batch = keys.len(),
                        failed = failures.len(),
                        "Failed to delete some blobs {rendered:?}"
                    );
                    self.record(BatchDeleteError::Partial { failures });
                } else {
                    debug!(batch = keys.len(), "deleted batch of blobs");
                }
            }
            Err(err) => {
                warn!(batch = keys.len(), error = %err, "bulk delete request failed");
                self.outcome.outstanding.extend(keys);
                self.record(BatchDeleteError::Client(err));
            }
        }
    }

    fn acknowledge(&mut self, key: &str, size: u64) {
        self.outcome.outstanding.remove(key);
        self.outcome.deleted_count += 1;
        self.outcome.deleted_bytes += size;
    }

    fn record(&mut self, error: BatchDeleteError) {
        self.outcome.last_error = Some(SuppressedErrors::use_or_suppress(
            self.outcome.last_error.take(),
            error,
        ));
    }
}
