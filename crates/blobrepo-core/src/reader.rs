//! Resumable range reads.
//!
//! [`RetryingRangeReader`] delivers one object (or one inclusive byte range
//! of it) as a forward-only byte stream. When the underlying transfer fails
//! with an I/O error, the reader opens a fresh range request starting
//! exactly at the first undelivered byte, so callers never observe gaps or
//! duplicated bytes. A bounded number of attempts is made; no delay is
//! inserted between them.
//!
//! # State machine
//!
//! ```text
//!            read error, attempts left
//!           +-------------------------+
//!           v                         |
//!   open -> Open --- transport EOF ---+--> Drained
//!           |                         |
//!           |                         |
//!           +-- attempts spent or ----+--> Failed
//!           |   reopen failed         |
//!           +-------- close() --------+--> Closed
//! ```
//!
//! `Failed` is terminal: once a read has returned an error, every later read
//! fails with [`BlobStoreError::IllegalState`] instead of reporting a short
//! end of stream.

use std::{collections::VecDeque, fmt, io, sync::Arc};

use bytes::Bytes;
use futures::Stream;
use tracing::debug;

use crate::{
    client::{BodyStream, ObjectClient},
    error::{BlobStoreError, BlobStoreResult},
    key::ByteRange,
};

/// Failures retained per reader as suppressed causes.
pub const MAX_SUPPRESSED_FAILURES: usize = 10;

enum ReadState {
    /// A transfer is in flight.
    Open(Box<dyn BodyStream>),
    /// The transfer ended; further reads return end-of-stream.
    Drained,
    /// A read failed for good; further reads fail.
    Failed,
    /// The reader was closed; further reads fail.
    Closed,
}

impl fmt::Debug for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(_) => f.write_str("Open"),
            Self::Drained => f.write_str("Drained"),
            Self::Failed => f.write_str("Failed"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// A forward-only reader over one object that resumes after I/O failures.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobrepo_core::{ByteRange, InMemoryObjectClient, RetryingRangeReader};
/// use bytes::Bytes;
///
/// tokio_test::block_on(async {
///     let client = Arc::new(InMemoryObjectClient::new("bucket"));
///     client.insert("k", Bytes::from_static(b"0123456789"));
///
///     let range = ByteRange::new(2, 5).unwrap();
///     let mut reader = RetryingRangeReader::open(client, "k", range, 11).await.unwrap();
///     assert_eq!(reader.read_to_end().await.unwrap(), b"2345".to_vec());
/// });
/// ```
pub struct RetryingRangeReader {
    client: Arc<dyn ObjectClient>,
    key: String,
    range: ByteRange,
    max_attempts: u32,
    /// Bytes delivered to the caller so far.
    offset: u64,
    /// Exclusive absolute end of the most recently opened transfer.
    stream_end: u64,
    attempt: u32,
    failures: VecDeque<io::Error>,
    eof: bool,
    state: ReadState,
    pending: Bytes,
}

impl fmt::Debug for RetryingRangeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingRangeReader")
            .field("bucket", &self.client.bucket())
            .field("key", &self.key)
            .field("range", &self.range)
            .field("offset", &self.offset)
            .field("stream_end", &self.stream_end)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("eof", &self.eof)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RetryingRangeReader {
    /// Open `range` of the object at `key`.
    ///
    /// The first range request is issued immediately: a missing object
    /// surfaces here as [`BlobStoreError::NotFound`].
    pub async fn open(
        client: Arc<dyn ObjectClient>,
        key: impl Into<String>,
        range: ByteRange,
        max_attempts: u32,
    ) -> BlobStoreResult<Self> {
        let mut reader = Self {
            client,
            key: key.into(),
            range,
            max_attempts,
            offset: 0,
            stream_end: range.start(),
            attempt: 1,
            failures: VecDeque::with_capacity(MAX_SUPPRESSED_FAILURES),
            eof: false,
            state: ReadState::Drained,
            pending: Bytes::new(),
        };
        let body = reader.open_stream().await?;
        reader.state = ReadState::Open(body);
        Ok(reader)
    }

    /// A reader that is already at end of stream, for zero-length ranges.
    ///
    /// No request is sent.
    #[must_use]
    pub fn empty(client: Arc<dyn ObjectClient>, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
            range: ByteRange::full(),
            max_attempts: 1,
            offset: 0,
            stream_end: 0,
            attempt: 1,
            failures: VecDeque::new(),
            eof: true,
            state: ReadState::Drained,
            pending: Bytes::new(),
        }
    }

    /// Open the whole object at `key`.
    pub async fn open_full(
        client: Arc<dyn ObjectClient>,
        key: impl Into<String>,
        max_attempts: u32,
    ) -> BlobStoreResult<Self> {
        Self::open(client, key, ByteRange::full(), max_attempts).await
    }

    /// The key being read.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Absolute object offset of the next byte to deliver.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.range.start() + self.offset
    }

    /// The attempt currently in progress, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether every byte of the range has been delivered.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof || self.position() == self.stream_end
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReadState::Closed)
    }

    /// The next chunk of the range, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> BlobStoreResult<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        loop {
            let body = match &mut self.state {
                ReadState::Open(body) => body,
                ReadState::Drained => return Ok(None),
                ReadState::Failed => {
                    return Err(BlobStoreError::illegal_state(format!(
                        "reader for [{}] used after a failed read",
                        self.key
                    )));
                }
                ReadState::Closed => {
                    return Err(BlobStoreError::illegal_state(format!(
                        "reader for [{}] used after close",
                        self.key
                    )));
                }
            };
            match body.next_chunk().await {
                Ok(Some(chunk)) if chunk.is_empty() => {}
                Ok(Some(chunk)) => {
                    self.offset += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                Ok(None) => {
                    self.eof = true;
                    self.state = ReadState::Drained;
                    return Ok(None);
                }
                Err(err) => self.reopen_or_fail(err).await?,
            }
        }
    }

    /// Copy up to `buf.len()` bytes into `buf`, returning how many were
    /// copied; `0` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> BlobStoreResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(mut chunk) = self.next_chunk().await? else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk.split_to(n));
        self.pending = chunk;
        Ok(n)
    }

    /// Read the rest of the range into memory.
    pub async fn read_to_end(&mut self) -> BlobStoreResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Turn the reader into a [`Stream`] of chunks.
    pub fn into_stream(self) -> impl Stream<Item = BlobStoreResult<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }

    /// Release the transfer, aborting it when expected bytes remain.
    ///
    /// Further reads fail with [`BlobStoreError::IllegalState`].
    pub fn close(&mut self) {
        self.maybe_abort();
        self.pending = Bytes::new();
        self.state = ReadState::Closed;
    }

    /// Always fails: the reader only moves forward.
    pub fn skip(&mut self, _n: u64) -> BlobStoreResult<u64> {
        Err(BlobStoreError::Unsupported { operation: "skip" })
    }

    /// Always fails: the reader only moves forward.
    pub fn reset(&mut self) -> BlobStoreResult<()> {
        Err(BlobStoreError::Unsupported { operation: "reset" })
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    async fn open_stream(&mut self) -> BlobStoreResult<Box<dyn BodyStream>> {
        let request_range = if self.offset > 0 || !self.range.is_full() {
            Some(self.range.resume_after(self.offset))
        } else {
            None
        };
        let body = match self.client.get_object(&self.key, request_range).await {
            Ok(body) => body,
            Err(err) if err.is_not_found() => {
                return Err(BlobStoreError::NotFound {
                    key: self.key.clone(),
                    source: Some(err),
                });
            }
            Err(err) => {
                return Err(BlobStoreError::client(
                    format!(
                        "Failed to open [{}/{}] at offset [{}]",
                        self.client.bucket(),
                        self.key,
                        self.position()
                    ),
                    err,
                ));
            }
        };
        self.stream_end = self
            .position()
            .checked_add(body.content_length)
            .ok_or_else(|| {
                BlobStoreError::illegal_state(format!(
                    "declared length of [{}] overflows the key space",
                    self.key
                ))
            })?;
        Ok(body.stream)
    }

    async fn reopen_or_fail(&mut self, err: io::Error) -> BlobStoreResult<()> {
        if self.is_eof() {
            debug!(
                bucket = %self.client.bucket(),
                key = %self.key,
                offset = self.position(),
                error = %err,
                "read failed after every expected byte arrived, treating as end of stream"
            );
            self.eof = true;
            self.state = ReadState::Drained;
            return Ok(());
        }

        if self.attempt >= self.max_attempts {
            debug!(
                bucket = %self.client.bucket(),
                key = %self.key,
                offset = self.position(),
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "failed reading, giving up"
            );
            self.maybe_abort();
            self.state = ReadState::Failed;
            return Err(BlobStoreError::ReadExhausted {
                key: self.key.clone(),
                offset: self.position(),
                attempts: self.attempt,
                source: err,
                suppressed: self.failures.drain(..).collect(),
            });
        }

        debug!(
            bucket = %self.client.bucket(),
            key = %self.key,
            offset = self.position(),
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            error = %err,
            "failed reading, retrying"
        );
        self.attempt += 1;
        if self.failures.len() == MAX_SUPPRESSED_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(err);
        self.maybe_abort();
        self.state = ReadState::Failed;

        match self.open_stream().await {
            Ok(body) => {
                self.state = ReadState::Open(body);
                Ok(())
            }
            Err(source) => Err(BlobStoreError::ReopenFailed {
                key: self.key.clone(),
                offset: self.position(),
                attempts: self.attempt,
                source: Box::new(source),
                suppressed: self.failures.drain(..).collect(),
            }),
        }
    }

    /// Abort the open transfer when it still owes bytes, so dropping it does
    /// not drain the rest of the response.
    fn maybe_abort(&mut self) {
        if self.is_eof() {
            return;
        }
        if self.position() < self.stream_end {
            if let ReadState::Open(body) = &mut self.state {
                body.abort();
            }
        }
    }
}

impl Drop for RetryingRangeReader {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.maybe_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::TryStreamExt;

    use super::*;
    use crate::memory::InMemoryObjectClient;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn client_with(key: &str, data: Bytes) -> Arc<InMemoryObjectClient> {
        let client = Arc::new(InMemoryObjectClient::new("bucket").with_chunk_size(100));
        client.insert(key, data);
        client
    }

    #[tokio::test]
    async fn test_should_read_whole_object() {
        let data = payload(1000);
        let client = client_with("k", data.clone());
        let mut reader = RetryingRangeReader::open_full(client, "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(read, data.to_vec());
        assert!(reader.is_eof());
    }

    #[tokio::test]
    async fn test_should_read_inclusive_range() {
        let data = payload(1024);
        let client = client_with("k", data.clone());
        let range = ByteRange::new(100, 199).unwrap_or_else(|e| panic!("range: {e}"));
        let mut reader = RetryingRangeReader::open(client, "k", range, 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(read, data[100..=199].to_vec());
    }

    #[tokio::test]
    async fn test_should_resume_after_transient_failures() {
        let data = payload(1000);
        let client = client_with("k", data.clone());
        client.break_next_reads(50, 10);

        let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));

        assert_eq!(read, data.to_vec());
        assert_eq!(reader.attempt(), 11);
    }

    #[tokio::test]
    async fn test_should_request_exact_resume_offset() {
        let data = payload(1000);
        let client = client_with("k", data.clone());
        client.break_next_reads(250, 1);
        let range = ByteRange::new(100, 899).unwrap_or_else(|e| panic!("range: {e}"));

        let mut reader = RetryingRangeReader::open(client.clone(), "k", range, 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(read, data[100..=899].to_vec());

        let ranges = client.get_ranges("k");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].map(|r| r.header_value()).as_deref(), Some("bytes=100-899"));
        assert_eq!(ranges[1].map(|r| r.header_value()).as_deref(), Some("bytes=350-899"));
    }

    #[tokio::test]
    async fn test_should_give_up_after_max_attempts() {
        let client = client_with("k", payload(1000));
        client.break_next_reads(10, 100);

        let mut reader = RetryingRangeReader::open_full(client, "k", 3)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let err = reader.read_to_end().await;
        match err {
            Err(BlobStoreError::ReadExhausted {
                attempts,
                offset,
                suppressed,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(offset, 30);
                assert_eq!(suppressed.len(), 2);
            }
            other => panic!("expected ReadExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_keep_failing_after_giving_up() {
        let client = client_with("k", payload(1000));
        client.break_next_reads(10, 100);

        let mut reader = RetryingRangeReader::open_full(client, "k", 3)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        assert!(matches!(
            reader.read_to_end().await,
            Err(BlobStoreError::ReadExhausted { .. })
        ));
        assert!(matches!(
            reader.read_to_end().await,
            Err(BlobStoreError::IllegalState { .. })
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(BlobStoreError::IllegalState { .. })
        ));
        assert!(!reader.is_eof());
    }

    #[tokio::test]
    async fn test_should_keep_read_failures_when_reopen_fails() {
        let client = client_with("k", payload(1000));
        client.break_next_reads(30, 1);

        let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let first = reader
            .next_chunk()
            .await
            .unwrap_or_else(|e| panic!("first chunk: {e}"));
        assert_eq!(first.map(|c| c.len()), Some(30));

        client
            .delete_objects(&["k".to_owned()], true)
            .await
            .unwrap_or_else(|e| panic!("delete: {e}"));

        let err = reader
            .read_to_end()
            .await
            .err()
            .unwrap_or_else(|| panic!("read should fail once the object is gone"));
        assert!(err.is_not_found());
        match err {
            BlobStoreError::ReopenFailed {
                offset,
                attempts,
                source,
                suppressed,
                ..
            } => {
                assert_eq!(offset, 30);
                assert_eq!(attempts, 2);
                assert_eq!(suppressed.len(), 1);
                assert!(matches!(*source, BlobStoreError::NotFound { .. }));
            }
            other => panic!("expected ReopenFailed, got {other:?}"),
        }

        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(BlobStoreError::IllegalState { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_cap_suppressed_failures() {
        let client = client_with("k", payload(1000));
        client.break_next_reads(1, 100);

        let mut reader = RetryingRangeReader::open_full(client, "k", 20)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        match reader.read_to_end().await {
            Err(BlobStoreError::ReadExhausted { suppressed, .. }) => {
                assert_eq!(suppressed.len(), MAX_SUPPRESSED_FAILURES);
            }
            other => panic!("expected ReadExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_report_eof_when_failure_follows_last_byte() {
        let data = payload(300);
        let client = client_with("k", data.clone());
        client.break_next_reads(300, 1);

        let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(read, data.to_vec());
        assert_eq!(client.get_ranges("k").len(), 1);
    }

    #[tokio::test]
    async fn test_should_map_missing_object_to_not_found() {
        let client = Arc::new(InMemoryObjectClient::new("bucket"));
        let err = RetryingRangeReader::open_full(client, "absent", 11).await;
        assert!(matches!(err, Err(BlobStoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_should_abort_on_close_with_bytes_remaining() {
        let client = client_with("k", payload(1000));
        let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let _ = reader
            .next_chunk()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        reader.close();
        assert_eq!(client.stream_aborts(), 1);

        let err = reader.next_chunk().await;
        assert!(matches!(err, Err(BlobStoreError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn test_should_not_abort_when_fully_read() {
        let client = client_with("k", payload(200));
        let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let _ = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        reader.close();
        assert_eq!(client.stream_aborts(), 0);
    }

    #[tokio::test]
    async fn test_should_abort_when_dropped_early() {
        let client = client_with("k", payload(1000));
        {
            let mut reader = RetryingRangeReader::open_full(client.clone(), "k", 11)
                .await
                .unwrap_or_else(|e| panic!("open: {e}"));
            let _ = reader.next_chunk().await;
        }
        assert_eq!(client.stream_aborts(), 1);
    }

    #[tokio::test]
    async fn test_should_create_empty_reader_without_request() {
        let client = Arc::new(InMemoryObjectClient::new("bucket"));
        let mut reader = RetryingRangeReader::empty(client.clone(), "absent");
        assert!(reader.is_eof());
        let read = reader
            .read_to_end()
            .await
            .unwrap_or_else(|e| panic!("read: {e}"));
        assert!(read.is_empty());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_should_reject_skip_and_reset() {
        let client = client_with("k", payload(10));
        let mut reader = RetryingRangeReader::open_full(client, "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        assert!(matches!(
            reader.skip(1),
            Err(BlobStoreError::Unsupported { operation: "skip" })
        ));
        assert!(matches!(
            reader.reset(),
            Err(BlobStoreError::Unsupported { operation: "reset" })
        ));
    }

    #[tokio::test]
    async fn test_should_fill_small_buffers() {
        let data = payload(250);
        let client = client_with("k", data.clone());
        let mut reader = RetryingRangeReader::open_full(client, "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .unwrap_or_else(|e| panic!("read: {e}"));
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data.to_vec());
    }

    #[tokio::test]
    async fn test_should_stream_chunks() {
        let data = payload(450);
        let client = client_with("k", data.clone());
        client.break_next_reads(120, 2);
        let reader = RetryingRangeReader::open_full(client, "k", 11)
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let chunks: Vec<Bytes> = reader
            .into_stream()
            .try_collect()
            .await
            .unwrap_or_else(|e| panic!("stream: {e}"));
        assert_eq!(chunks.concat(), data.to_vec());
    }
}
