//! Chunked and multipart uploads.
//!
//! Two paths write an object:
//!
//! - [`upload_sized`]: the size is known up front. Objects up to the buffer
//!   size go out in one put; larger ones are split into parts of exactly the
//!   buffer size (the last part carries the remainder).
//! - [`ChunkedUploadWriter`]: the size is unknown. Bytes are buffered up to
//!   the part size and a full buffer is only flushed once more bytes arrive,
//!   so a payload that fits in one part is always written with a single put.
//!
//! Any failure after a multipart upload was initiated aborts it. Abort
//! failures are logged and never replace the original error.

use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::{
    client::{CompletedPart, ObjectClient},
    config::UploadLimits,
    error::{BlobStoreError, BlobStoreResult},
};

/// Number of parts of `part_size` bytes needed for `total` bytes, and the
/// size of the last (or only) part.
///
/// # Examples
///
/// ```
/// use blobrepo_core::upload::number_of_parts;
///
/// assert_eq!(number_of_parts(150, 64).unwrap(), (3, 22));
/// assert_eq!(number_of_parts(128, 64).unwrap(), (2, 64));
/// assert_eq!(number_of_parts(10, 64).unwrap(), (1, 10));
/// assert!(number_of_parts(10, 0).is_err());
/// ```
pub fn number_of_parts(total: u64, part_size: u64) -> BlobStoreResult<(u64, u64)> {
    if part_size == 0 {
        return Err(BlobStoreError::invalid_argument(
            "Part size must be greater than zero",
        ));
    }
    if total == 0 || total <= part_size {
        return Ok((1, total));
    }
    let parts = total / part_size;
    let remaining = total % part_size;
    if remaining == 0 {
        Ok((parts, part_size))
    } else {
        Ok((parts + 1, remaining))
    }
}

// ---------------------------------------------------------------------------
// Size-known path
// ---------------------------------------------------------------------------

/// Write exactly `blob_size` bytes from `source` to `key`.
///
/// Uses a single put when `blob_size <= buffer_size`, otherwise a multipart
/// upload with parts of `buffer_size` bytes.
pub async fn upload_sized<R>(
    client: &Arc<dyn ObjectClient>,
    key: &str,
    source: R,
    blob_size: u64,
    buffer_size: u64,
    limits: &UploadLimits,
) -> BlobStoreResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    if blob_size <= buffer_size {
        execute_single_upload(client, key, source, blob_size, buffer_size, limits).await
    } else {
        execute_multipart_upload(client, key, source, blob_size, buffer_size, limits).await
    }
}

async fn execute_single_upload<R>(
    client: &Arc<dyn ObjectClient>,
    key: &str,
    mut source: R,
    blob_size: u64,
    buffer_size: u64,
    limits: &UploadLimits,
) -> BlobStoreResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    if blob_size > limits.max_single_upload {
        return Err(BlobStoreError::invalid_argument(format!(
            "Upload request size [{blob_size}] can't be larger than {}",
            limits.max_single_upload
        )));
    }
    if blob_size > buffer_size {
        return Err(BlobStoreError::invalid_argument(format!(
            "Upload request size [{blob_size}] can't be larger than buffer size"
        )));
    }

    let body = read_exactly(&mut source, blob_size)
        .await
        .map_err(|e| BlobStoreError::io(format!("Failed to read source of [{key}]"), e))?;
    client.put_object(key, body).await.map_err(|e| {
        BlobStoreError::client(
            format!("Unable to upload object [{key}] using a single upload"),
            e,
        )
    })?;
    debug!(key, size = blob_size, "uploaded object with a single put");
    Ok(())
}

async fn execute_multipart_upload<R>(
    client: &Arc<dyn ObjectClient>,
    key: &str,
    mut source: R,
    blob_size: u64,
    part_size: u64,
    limits: &UploadLimits,
) -> BlobStoreResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    ensure_multipart_upload_size(blob_size, limits)?;
    let (nb_parts, last_part_size) = number_of_parts(blob_size, part_size)?;
    if nb_parts > limits.max_parts {
        return Err(BlobStoreError::invalid_argument(format!(
            "Too many multipart upload requests ({nb_parts} > {}), maybe try a larger buffer size?",
            limits.max_parts
        )));
    }
    let nb_parts = u32::try_from(nb_parts).map_err(|_| {
        BlobStoreError::invalid_argument(format!("part count [{nb_parts}] is out of range"))
    })?;

    let upload_id = initiate(client.as_ref(), key).await?;

    let result: BlobStoreResult<()> = async {
        let mut parts = Vec::with_capacity(nb_parts as usize);
        let mut bytes_count = 0u64;
        for part_number in 1..=nb_parts {
            let is_last = part_number == nb_parts;
            let size = if is_last { last_part_size } else { part_size };
            let body = read_exactly(&mut source, size).await.map_err(|e| {
                BlobStoreError::io(
                    format!("Failed to read part {part_number} of [{key}] from source"),
                    e,
                )
            })?;
            bytes_count += size;
            let part = client
                .upload_part(key, &upload_id, part_number, body, is_last)
                .await
                .map_err(|e| {
                    BlobStoreError::client(
                        format!("Unable to upload object [{key}] using multipart upload"),
                        e,
                    )
                })?;
            parts.push(part);
        }

        if bytes_count != blob_size {
            return Err(BlobStoreError::illegal_state(format!(
                "Failed to execute multipart upload for [{key}], expected {blob_size} bytes sent but got {bytes_count}"
            )));
        }

        client
            .complete_multipart_upload(key, &upload_id, &parts)
            .await
            .map_err(|e| {
                BlobStoreError::client(
                    format!("Unable to upload object [{key}] using multipart upload"),
                    e,
                )
            })
    }
    .await;

    match result {
        Ok(()) => {
            debug!(key, size = blob_size, parts = nb_parts, "completed multipart upload");
            Ok(())
        }
        Err(err) => {
            abort_upload(client.as_ref(), key, &upload_id).await;
            Err(err)
        }
    }
}

fn ensure_multipart_upload_size(blob_size: u64, limits: &UploadLimits) -> BlobStoreResult<()> {
    if blob_size > limits.max_multipart_size {
        return Err(BlobStoreError::invalid_argument(format!(
            "Multipart upload request size [{blob_size}] can't be larger than {}",
            limits.max_multipart_size
        )));
    }
    if blob_size < limits.min_multipart_size {
        return Err(BlobStoreError::invalid_argument(format!(
            "Multipart upload request size [{blob_size}] can't be smaller than {}",
            limits.min_multipart_size
        )));
    }
    Ok(())
}

async fn read_exactly<R>(source: &mut R, size: u64) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin + Send,
{
    let len = usize::try_from(size)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn initiate(client: &dyn ObjectClient, key: &str) -> BlobStoreResult<String> {
    let upload_id = client.create_multipart_upload(key).await.map_err(|e| {
        BlobStoreError::client(format!("Failed to initialize multipart upload [{key}]"), e)
    })?;
    if upload_id.is_empty() {
        return Err(BlobStoreError::illegal_state(format!(
            "Failed to initialize multipart upload [{key}]: empty upload id"
        )));
    }
    debug!(key, upload_id = %upload_id, "initiated multipart upload");
    Ok(upload_id)
}

/// Abort a multipart upload, logging instead of propagating failures.
pub(crate) async fn abort_upload(client: &dyn ObjectClient, key: &str, upload_id: &str) {
    match client.abort_multipart_upload(key, upload_id).await {
        Ok(()) => debug!(key, upload_id, "aborted multipart upload"),
        Err(err) => warn!(key, upload_id, error = %err, "failed to abort multipart upload"),
    }
}

// ---------------------------------------------------------------------------
// ChunkedUploadWriter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Completed,
    Aborted,
}

/// A sink that turns a byte stream of unknown length into one object.
///
/// Callers [`write`](Self::write) bytes, call
/// [`mark_success`](Self::mark_success) when the payload is complete, then
/// [`close`](Self::close). Closing a writer that was not marked successful
/// aborts any multipart upload it started and leaves no object behind.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobrepo_core::{ChunkedUploadWriter, InMemoryObjectClient};
///
/// tokio_test::block_on(async {
///     let client = Arc::new(InMemoryObjectClient::new("bucket"));
///     let mut writer = ChunkedUploadWriter::new(client.clone(), "k", 4).unwrap();
///     writer.write(b"0123456789").await.unwrap();
///     writer.mark_success();
///     writer.close().await.unwrap();
///     assert_eq!(client.object("k").unwrap().as_ref(), b"0123456789");
/// });
/// ```
pub struct ChunkedUploadWriter {
    client: Arc<dyn ObjectClient>,
    key: String,
    part_size: usize,
    max_parts: u64,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    flushed_bytes: u64,
    successful: bool,
    poisoned: bool,
    state: WriterState,
}

impl fmt::Debug for ChunkedUploadWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedUploadWriter")
            .field("key", &self.key)
            .field("part_size", &self.part_size)
            .field("buffered", &self.buffer.len())
            .field("upload_id", &self.upload_id)
            .field("parts", &self.parts.len())
            .field("flushed_bytes", &self.flushed_bytes)
            .field("successful", &self.successful)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ChunkedUploadWriter {
    /// Create a writer for `key` flushing parts of `part_size` bytes.
    pub fn new(
        client: Arc<dyn ObjectClient>,
        key: impl Into<String>,
        part_size: u64,
    ) -> BlobStoreResult<Self> {
        if part_size == 0 {
            return Err(BlobStoreError::invalid_argument(
                "Part size must be greater than zero",
            ));
        }
        let part_size = usize::try_from(part_size).map_err(|_| {
            BlobStoreError::invalid_argument(format!(
                "Part size [{part_size}] does not fit in memory"
            ))
        })?;
        Ok(Self {
            client,
            key: key.into(),
            part_size,
            max_parts: UploadLimits::default().max_parts,
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
            flushed_bytes: 0,
            successful: false,
            poisoned: false,
            state: WriterState::Open,
        })
    }

    /// Limit the number of parts this writer may upload.
    #[must_use]
    pub fn with_max_parts(mut self, max_parts: u64) -> Self {
        self.max_parts = max_parts;
        self
    }

    /// The target key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes already uploaded as parts.
    #[must_use]
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes
    }

    /// Bytes buffered and not yet uploaded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The multipart upload id, once the first part was flushed.
    #[must_use]
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Append `data` to the object.
    pub async fn write(&mut self, mut data: &[u8]) -> BlobStoreResult<()> {
        self.ensure_writable()?;
        while !data.is_empty() {
            if self.buffer.len() == self.part_size {
                if let Err(err) = self.flush_part(false).await {
                    self.poisoned = true;
                    return Err(err);
                }
            }
            let room = self.part_size - self.buffer.len();
            let n = room.min(data.len());
            self.buffer.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Declare the payload complete; [`close`](Self::close) will then commit
    /// the object.
    pub fn mark_success(&mut self) {
        self.successful = true;
    }

    /// Commit the object if the writer was marked successful, otherwise
    /// abort any multipart upload in progress.
    ///
    /// A failed commit also aborts. Closing an unsuccessful writer returns
    /// `Ok(())` once the abort was attempted.
    pub async fn close(mut self) -> BlobStoreResult<()> {
        if self.state != WriterState::Open {
            return Err(BlobStoreError::illegal_state(format!(
                "writer for [{}] is already closed",
                self.key
            )));
        }

        if !self.successful {
            self.abort().await;
            return Ok(());
        }
        if self.poisoned {
            self.abort().await;
            return Err(BlobStoreError::illegal_state(format!(
                "writer for [{}] was marked successful after a failed write",
                self.key
            )));
        }

        match self.complete().await {
            Ok(()) => {
                self.state = WriterState::Completed;
                Ok(())
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    fn ensure_writable(&self) -> BlobStoreResult<()> {
        if self.state != WriterState::Open {
            return Err(BlobStoreError::illegal_state(format!(
                "writer for [{}] is closed",
                self.key
            )));
        }
        if self.poisoned {
            return Err(BlobStoreError::illegal_state(format!(
                "writer for [{}] failed a previous write",
                self.key
            )));
        }
        Ok(())
    }

    async fn complete(&mut self) -> BlobStoreResult<()> {
        if self.flushed_bytes == 0 {
            let body = self.buffer.split().freeze();
            let size = body.len();
            self.client.put_object(&self.key, body).await.map_err(|e| {
                BlobStoreError::client(
                    format!("Unable to upload object [{}] using a single upload", self.key),
                    e,
                )
            })?;
            debug!(key = %self.key, size, "uploaded object with a single put");
            return Ok(());
        }

        self.flush_part(true).await?;
        let upload_id = self.upload_id.as_deref().ok_or_else(|| {
            BlobStoreError::illegal_state(format!("no multipart upload for [{}]", self.key))
        })?;
        self.client
            .complete_multipart_upload(&self.key, upload_id, &self.parts)
            .await
            .map_err(|e| {
                BlobStoreError::client(
                    format!("Unable to complete multipart upload of [{}]", self.key),
                    e,
                )
            })?;
        debug!(
            key = %self.key,
            size = self.flushed_bytes,
            parts = self.parts.len(),
            "completed multipart upload"
        );
        Ok(())
    }

    async fn flush_part(&mut self, is_last: bool) -> BlobStoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.parts.len() as u64 >= self.max_parts {
            return Err(BlobStoreError::invalid_argument(format!(
                "Too many multipart upload parts for [{}], maybe try a larger buffer size?",
                self.key
            )));
        }
        let part_number = u32::try_from(self.parts.len() + 1).map_err(|_| {
            BlobStoreError::invalid_argument(format!("too many parts for [{}]", self.key))
        })?;

        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = initiate(self.client.as_ref(), &self.key).await?;
                self.upload_id = Some(id.clone());
                id
            }
        };

        let body = self.buffer.split().freeze();
        let size = body.len() as u64;
        let part = self
            .client
            .upload_part(&self.key, &upload_id, part_number, body, is_last)
            .await
            .map_err(|e| {
                BlobStoreError::client(
                    format!("Unable to upload part {part_number} of [{}]", self.key),
                    e,
                )
            })?;
        self.flushed_bytes += size;
        self.parts.push(part);
        self.buffer.reserve(self.part_size);
        Ok(())
    }

    async fn abort(&mut self) {
        self.state = WriterState::Aborted;
        self.buffer.clear();
        if let Some(upload_id) = self.upload_id.as_deref() {
            abort_upload(self.client.as_ref(), &self.key, upload_id).await;
        }
    }
}

impl Drop for ChunkedUploadWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            if let Some(upload_id) = self.upload_id.as_deref() {
                warn!(
                    key = %self.key,
                    upload_id,
                    "writer dropped without close, multipart upload left pending"
                );
            }
        }
    }
}
