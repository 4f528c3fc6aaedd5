//! The blob container facade.
//!
//! A [`BlobContainer`] addresses the blobs under one key prefix. It resolves
//! blob names to keys and combines the resumable reader, the upload paths and
//! the bulk-delete coordinator into read, write, list and delete operations.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::{
    client::{ListPage, ListRequest, ObjectClient},
    config::MIB,
    delete::BulkDeleteCoordinator,
    error::{BlobStoreError, BlobStoreResult, ClientError},
    key::{BlobPath, ByteRange, ObjectKey, SEPARATOR},
    listing::ListingWalker,
    reader::RetryingRangeReader,
    store::BlobStore,
    upload::{ChunkedUploadWriter, upload_sized},
};

/// Preferred length of bounded reads.
pub const READ_BLOB_PREFERRED_LENGTH: u64 = 32 * MIB;

/// A listed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Name relative to the container.
    pub name: String,
    /// Size in bytes.
    pub length: u64,
}

/// Totals of a container deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Blobs deleted.
    pub blobs_deleted: u64,
    /// Bytes deleted.
    pub bytes_deleted: u64,
}

/// Blobs under one key prefix.
#[derive(Debug, Clone)]
pub struct BlobContainer {
    store: BlobStore,
    path: BlobPath,
    key_path: String,
}

impl BlobContainer {
    pub(crate) fn new(store: BlobStore, path: BlobPath) -> Self {
        let key_path = path.as_key_prefix();
        Self {
            store,
            path,
            key_path,
        }
    }

    /// The container's path.
    #[must_use]
    pub fn path(&self) -> &BlobPath {
        &self.path
    }

    /// The key prefix of every blob in the container.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// The full key of blob `name`.
    #[must_use]
    pub fn build_key(&self, name: &str) -> ObjectKey {
        ObjectKey::join(&self.key_path, name)
    }

    fn client(&self) -> Arc<dyn ObjectClient> {
        Arc::clone(self.store.client())
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Whether blob `name` exists.
    pub async fn blob_exists(&self, name: &str) -> BlobStoreResult<bool> {
        let key = self.build_key(name);
        self.store
            .client()
            .object_exists(key.as_str())
            .await
            .map_err(|e| {
                BlobStoreError::client(format!("Failed to check if blob [{name}] exists"), e)
            })
    }

    /// Open blob `name` for reading.
    pub async fn read_blob(&self, name: &str) -> BlobStoreResult<RetryingRangeReader> {
        let key = self.build_key(name);
        RetryingRangeReader::open_full(
            self.client(),
            key.into_string(),
            self.store.config().max_read_attempts,
        )
        .await
    }

    /// Open `length` bytes of blob `name` starting at `position`.
    ///
    /// A zero length yields an empty reader without contacting the store.
    pub async fn read_blob_range(
        &self,
        name: &str,
        position: u64,
        length: u64,
    ) -> BlobStoreResult<RetryingRangeReader> {
        let key = self.build_key(name);
        match ByteRange::with_length(position, length)? {
            None => Ok(RetryingRangeReader::empty(self.client(), key.into_string())),
            Some(range) => {
                RetryingRangeReader::open(
                    self.client(),
                    key.into_string(),
                    range,
                    self.store.config().max_read_attempts,
                )
                .await
            }
        }
    }

    /// Readers from this container must be fully consumed, so consumers
    /// should request bounded ranges of at most this many bytes.
    #[must_use]
    pub fn read_blob_preferred_length(&self) -> u64 {
        READ_BLOB_PREFERRED_LENGTH
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Write exactly `blob_size` bytes from `source` as blob `name`.
    ///
    /// `fail_if_exists` cannot be enforced: the store silently overwrites
    /// existing objects.
    pub async fn write_blob<R>(
        &self,
        name: &str,
        source: R,
        blob_size: u64,
        fail_if_exists: bool,
    ) -> BlobStoreResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = self.build_key(name);
        let config = self.store.config();
        debug!(
            key = %key,
            size = blob_size,
            fail_if_exists,
            "writing blob"
        );
        upload_sized(
            self.store.client(),
            key.as_str(),
            source,
            blob_size,
            config.buffer_size,
            &config.limits,
        )
        .await
    }

    /// Write `bytes` as blob `name`.
    pub async fn write_blob_bytes(
        &self,
        name: &str,
        bytes: Bytes,
        fail_if_exists: bool,
    ) -> BlobStoreResult<()> {
        let size = bytes.len() as u64;
        self.write_blob(name, &bytes[..], size, fail_if_exists)
            .await
    }

    /// Write `bytes` as blob `name` so readers never see a partial object.
    ///
    /// Every upload path only makes the object visible once complete, so
    /// this is the same as [`write_blob_bytes`](Self::write_blob_bytes).
    pub async fn write_blob_atomic(
        &self,
        name: &str,
        bytes: Bytes,
        fail_if_exists: bool,
    ) -> BlobStoreResult<()> {
        self.write_blob_bytes(name, bytes, fail_if_exists).await
    }

    /// Write blob `name` through a [`ChunkedUploadWriter`] handed to
    /// `writer_fn`.
    ///
    /// The object is committed only if `writer_fn` succeeds; otherwise any
    /// multipart upload in progress is aborted and the error is returned.
    /// `fail_if_exists` and `atomic` are accepted for interface parity and
    /// do not change behavior.
    ///
    /// Dropping the returned future before it completes does not abort a
    /// multipart upload that was already started: the writer cannot run the
    /// async abort from `Drop`, so it only logs a warning and the upload stays
    /// pending on the provider until a bucket lifecycle rule removes it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use blobrepo_core::{BlobStore, InMemoryObjectClient, RepositoryConfig};
    ///
    /// tokio_test::block_on(async {
    ///     let client = Arc::new(InMemoryObjectClient::new("b"));
    ///     let config = RepositoryConfig::builder().bucket("b".into()).build();
    ///     let container = BlobStore::new(client.clone(), config).unwrap().base_container();
    ///
    ///     container
    ///         .write_blob_with("meta.dat", false, true, |w| {
    ///             Box::pin(async move { w.write(b"payload").await })
    ///         })
    ///         .await
    ///         .unwrap();
    ///     assert_eq!(client.object("meta.dat").unwrap().as_ref(), b"payload");
    /// });
    /// ```
    pub async fn write_blob_with<F>(
        &self,
        name: &str,
        fail_if_exists: bool,
        atomic: bool,
        writer_fn: F,
    ) -> BlobStoreResult<()>
    where
        F: for<'w> FnOnce(&'w mut ChunkedUploadWriter) -> BoxFuture<'w, BlobStoreResult<()>> + Send,
    {
        let key = self.build_key(name);
        let config = self.store.config();
        debug!(key = %key, fail_if_exists, atomic, "writing blob through chunked writer");

        let mut writer = ChunkedUploadWriter::new(self.client(), key.into_string(), config.buffer_size)?
            .with_max_parts(config.limits.max_parts);
        match writer_fn(&mut writer).await {
            Ok(()) => {
                writer.mark_success();
                writer.close().await
            }
            Err(err) => {
                if let Err(close_err) = writer.close().await {
                    warn!(blob = name, error = %close_err, "failed to release chunked writer");
                }
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Delete blob `name`, failing with [`BlobStoreError::NotFound`] if it
    /// does not exist.
    pub async fn delete_blob(&self, name: &str) -> BlobStoreResult<()> {
        if !self.blob_exists(name).await? {
            return Err(BlobStoreError::NotFound {
                key: self.build_key(name).into_string(),
                source: None,
            });
        }
        self.delete_blobs_ignoring_if_not_exists([name]).await
    }

    /// Delete the named blobs; names that do not exist are ignored.
    pub async fn delete_blobs_ignoring_if_not_exists<I, S>(&self, names: I) -> BlobStoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut deletes = self.coordinator();
        for name in names {
            deletes
                .enqueue(self.build_key(name.as_ref()).into_string(), 0)
                .await;
        }
        deletes.finish().await.map(|_| ())
    }

    /// Delete every blob under this container, then the container's own
    /// prefix marker.
    ///
    /// Returns the number and total size of the listed blobs.
    pub async fn delete(&self) -> BlobStoreResult<DeleteResult> {
        let mut result = DeleteResult::default();
        let mut deletes = self.coordinator();
        let mut walker = ListingWalker::new(self.client(), ListRequest::new(&self.key_path));

        while let Some(page) = walker.next_page().await.map_err(|e| {
            BlobStoreError::client(
                format!("Exception when deleting blob container [{}]", self.key_path),
                e,
            )
        })? {
            for summary in page.objects {
                result.blobs_deleted += 1;
                result.bytes_deleted += summary.size;
                deletes.enqueue(summary.key, summary.size).await;
            }
        }

        deletes.flush().await;
        if !self.key_path.is_empty() {
            deletes.enqueue(self.key_path.clone(), 0).await;
        }
        deletes.finish().await?;

        debug!(
            container = %self.key_path,
            blobs = result.blobs_deleted,
            bytes = result.bytes_deleted,
            "deleted blob container"
        );
        Ok(result)
    }

    fn coordinator(&self) -> BulkDeleteCoordinator {
        BulkDeleteCoordinator::new(self.client(), self.store.config().bulk_delete_batch_size)
    }

    // -----------------------------------------------------------------------
    // List
    // -----------------------------------------------------------------------

    /// Blobs directly in this container whose name starts with `prefix`,
    /// keyed by name.
    pub async fn list_blobs_by_prefix(
        &self,
        prefix: Option<&str>,
    ) -> BlobStoreResult<BTreeMap<String, BlobMetadata>> {
        let list_prefix = match prefix {
            Some(prefix) => self.build_key(prefix).into_string(),
            None => self.key_path.clone(),
        };
        let pages = self
            .walk_delimited(list_prefix)
            .await
            .map_err(|e| {
                BlobStoreError::client(
                    format!("Exception when listing blobs by prefix [{}]", prefix.unwrap_or("")),
                    e,
                )
            })?;

        let mut blobs = BTreeMap::new();
        for summary in pages.into_iter().flat_map(|p| p.objects) {
            let Some(name) = summary
                .key
                .strip_prefix(self.key_path.as_str())
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            let name = name.to_owned();
            blobs.insert(name.clone(), BlobMetadata {
                name,
                length: summary.size,
            });
        }
        Ok(blobs)
    }

    /// Every blob directly in this container, keyed by name.
    pub async fn list_blobs(&self) -> BlobStoreResult<BTreeMap<String, BlobMetadata>> {
        self.list_blobs_by_prefix(None).await
    }

    /// The child containers, keyed by name.
    pub async fn children(&self) -> BlobStoreResult<BTreeMap<String, BlobContainer>> {
        let pages = self
            .walk_delimited(self.key_path.clone())
            .await
            .map_err(|e| {
                BlobStoreError::client(
                    format!("Exception when listing children of [{}]", self.key_path),
                    e,
                )
            })?;

        let mut children = BTreeMap::new();
        for prefix in pages.into_iter().flat_map(|p| p.common_prefixes) {
            let Some(name) = prefix
                .strip_prefix(self.key_path.as_str())
                .map(|rest| rest.strip_suffix(SEPARATOR).unwrap_or(rest))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            children.insert(
                name.to_owned(),
                self.store.blob_container(self.path.add(name)),
            );
        }
        Ok(children)
    }

    async fn walk_delimited(
        &self,
        prefix: String,
    ) -> Result<Vec<ListPage>, ClientError> {
        let request = ListRequest::new(prefix).with_delimiter(SEPARATOR.to_string());
        ListingWalker::new(self.client(), request)
            .collect_pages()
            .await
    }
}
