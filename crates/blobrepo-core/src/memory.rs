//! In-process [`ObjectClient`] implementation.
//!
//! [`InMemoryObjectClient`] keeps objects in a sorted map, stages multipart
//! parts per upload id, and serves delimiter listings with base64
//! continuation tokens. It mirrors the provider's observable behavior closely
//! enough to drive the engine end-to-end, and adds fault injection plus a
//! journal of every call so tests can assert on ordering.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use uuid::Uuid;

use crate::{
    client::{
        BodyStream, CompletedPart, ListPage, ListRequest, ObjectBody, ObjectClient, ObjectSummary,
    },
    config::MAX_BULK_DELETES,
    error::{ClientError, DeleteFailure},
    key::ByteRange,
};

/// Default number of entries per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default chunk size of object bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// A call received by [`InMemoryObjectClient`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    /// `object_exists`.
    Exists {
        /// Requested key.
        key: String,
    },
    /// `get_object`.
    Get {
        /// Requested key.
        key: String,
        /// Requested range.
        range: Option<ByteRange>,
    },
    /// `put_object`.
    Put {
        /// Target key.
        key: String,
        /// Body size.
        size: u64,
    },
    /// `create_multipart_upload`.
    CreateMultipart {
        /// Target key.
        key: String,
    },
    /// `upload_part`.
    UploadPart {
        /// Target key.
        key: String,
        /// Part number.
        part_number: u32,
        /// Part size.
        size: u64,
        /// Whether the caller flagged it as the last part.
        is_last: bool,
    },
    /// `complete_multipart_upload`.
    CompleteMultipart {
        /// Target key.
        key: String,
        /// Part numbers, in the order given.
        part_numbers: Vec<u32>,
    },
    /// `abort_multipart_upload`.
    AbortMultipart {
        /// Target key.
        key: String,
    },
    /// `delete_objects`.
    DeleteObjects {
        /// Keys of the batch.
        keys: Vec<String>,
        /// Quiet mode flag.
        quiet: bool,
    },
    /// `list_objects`.
    List {
        /// Listed prefix.
        prefix: String,
        /// Delimiter, if any.
        delimiter: Option<String>,
        /// Whether a continuation token was supplied.
        continued: bool,
    },
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    /// Per upcoming open: bytes to deliver before the stream breaks.
    read_breaks: VecDeque<u64>,
    failing_parts: HashSet<u32>,
    fail_create: bool,
    fail_complete: bool,
    fail_abort: bool,
    /// Key to error code.
    refused_deletes: HashMap<String, String>,
    /// 1-based indexes of `delete_objects` calls that fail as a whole.
    failing_delete_calls: HashSet<usize>,
    report_missing_keys: bool,
}

#[derive(Debug)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

#[derive(Debug)]
struct StagedPart {
    data: Bytes,
    etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, StagedPart>,
}

// ---------------------------------------------------------------------------
// InMemoryObjectClient
// ---------------------------------------------------------------------------

/// An [`ObjectClient`] backed by process memory.
///
/// # Examples
///
/// ```
/// use blobrepo_core::{InMemoryObjectClient, ObjectClient};
/// use bytes::Bytes;
///
/// tokio_test::block_on(async {
///     let client = InMemoryObjectClient::new("bucket");
///     client.put_object("a/b", Bytes::from_static(b"hi")).await.unwrap();
///     assert!(client.object_exists("a/b").await.unwrap());
///     assert_eq!(client.object("a/b"), Some(Bytes::from_static(b"hi")));
/// });
/// ```
#[derive(Debug)]
pub struct InMemoryObjectClient {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: DashMap<String, PendingUpload>,
    page_size: usize,
    chunk_size: usize,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<ClientCall>>,
    delete_calls: AtomicUsize,
    aborted_uploads: AtomicUsize,
    stream_aborts: Arc<AtomicUsize>,
}

impl InMemoryObjectClient {
    /// Create an empty store for `bucket`.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            uploads: DashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            faults: Mutex::new(Faults::default()),
            journal: Mutex::new(Vec::new()),
            delete_calls: AtomicUsize::new(0),
            aborted_uploads: AtomicUsize::new(0),
            stream_aborts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve listings in pages of at most `page_size` entries.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Serve object bodies in chunks of at most `chunk_size` bytes.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Direct access
    // -----------------------------------------------------------------------

    /// Store an object without going through the journal.
    pub fn insert(&self, key: impl Into<String>, data: Bytes) {
        let etag = compute_etag(&data);
        self.objects
            .write()
            .insert(key.into(), StoredObject { data, etag });
    }

    /// The content of the object at `key`.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    /// The tag of the object at `key`.
    #[must_use]
    pub fn etag(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|o| o.etag.clone())
    }

    /// Whether an object exists at `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    /// Every stored key, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Number of multipart uploads neither completed nor aborted.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Number of successfully aborted multipart uploads.
    #[must_use]
    pub fn aborted_uploads(&self) -> usize {
        self.aborted_uploads.load(Ordering::Relaxed)
    }

    /// Number of object bodies aborted before being fully read.
    #[must_use]
    pub fn stream_aborts(&self) -> usize {
        self.stream_aborts.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Journal access
    // -----------------------------------------------------------------------

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ClientCall> {
        self.journal.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.journal.lock().clear();
    }

    /// The ranges requested for `key`, in order.
    #[must_use]
    pub fn get_ranges(&self, key: &str) -> Vec<Option<ByteRange>> {
        self.journal
            .lock()
            .iter()
            .filter_map(|call| match call {
                ClientCall::Get { key: k, range } if k == key => Some(*range),
                _ => None,
            })
            .collect()
    }

    /// The key batches sent to `delete_objects`, in order.
    #[must_use]
    pub fn delete_batches(&self) -> Vec<Vec<String>> {
        self.journal
            .lock()
            .iter()
            .filter_map(|call| match call {
                ClientCall::DeleteObjects { keys, .. } => Some(keys.clone()),
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Make each of the next `times` opened bodies fail after delivering
    /// `after_bytes` bytes.
    pub fn break_next_reads(&self, after_bytes: u64, times: usize) {
        let mut faults = self.faults.lock();
        faults
            .read_breaks
            .extend(std::iter::repeat_n(after_bytes, times));
    }

    /// Reject uploads of part `part_number`.
    pub fn fail_part(&self, part_number: u32) {
        self.faults.lock().failing_parts.insert(part_number);
    }

    /// Reject multipart initiation.
    pub fn fail_create_multipart(&self) {
        self.faults.lock().fail_create = true;
    }

    /// Reject multipart completion.
    pub fn fail_complete_multipart(&self) {
        self.faults.lock().fail_complete = true;
    }

    /// Reject multipart aborts.
    pub fn fail_abort_multipart(&self) {
        self.faults.lock().fail_abort = true;
    }

    /// Report `key` as not deleted with error `code`.
    pub fn refuse_delete(&self, key: impl Into<String>, code: impl Into<String>) {
        self.faults
            .lock()
            .refused_deletes
            .insert(key.into(), code.into());
    }

    /// Fail the `call`-th (1-based) `delete_objects` call as a whole.
    pub fn fail_delete_call(&self, call: usize) {
        self.faults.lock().failing_delete_calls.insert(call);
    }

    /// Report absent keys as `NoSuchKey` failures in bulk deletes.
    pub fn report_missing_keys_on_delete(&self) {
        self.faults.lock().report_missing_keys = true;
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn record(&self, call: ClientCall) {
        trace!(bucket = %self.bucket, ?call, "in-memory store call");
        self.journal.lock().push(call);
    }

    fn list_page(&self, request: &ListRequest) -> Result<ListPage, ClientError> {
        let marker = request
            .continuation
            .as_deref()
            .map(decode_continuation_token)
            .transpose()?;
        let objects = self.objects.read();
        let entries = objects
            .range::<str, _>((Bound::Included(request.prefix.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&request.prefix))
            .map(|(key, obj)| (key.as_str(), obj.data.len() as u64));
        Ok(list_sorted(
            entries,
            &request.prefix,
            request.delimiter.as_deref().filter(|d| !d.is_empty()),
            marker.as_deref(),
            self.page_size,
        ))
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn object_exists(&self, key: &str) -> Result<bool, ClientError> {
        self.record(ClientCall::Exists {
            key: key.to_owned(),
        });
        Ok(self.contains(key))
    }

    async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody, ClientError> {
        self.record(ClientCall::Get {
            key: key.to_owned(),
            range,
        });
        let data = self
            .object(key)
            .ok_or_else(|| no_such_key(key))?;
        let data = match range {
            None => data,
            Some(range) => slice_range(&data, range)?,
        };
        let fail_after = self.faults.lock().read_breaks.pop_front();
        let content_length = data.len() as u64;
        Ok(ObjectBody {
            stream: Box::new(MemoryBody {
                data,
                chunk_size: self.chunk_size,
                fail_after,
                aborted: false,
                aborts: Arc::clone(&self.stream_aborts),
            }),
            content_length,
        })
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<String, ClientError> {
        self.record(ClientCall::Put {
            key: key.to_owned(),
            size: body.len() as u64,
        });
        let etag = compute_etag(&body);
        self.objects.write().insert(key.to_owned(), StoredObject {
            data: body,
            etag: etag.clone(),
        });
        Ok(etag)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, ClientError> {
        self.record(ClientCall::CreateMultipart {
            key: key.to_owned(),
        });
        if self.faults.lock().fail_create {
            return Err(injected("create multipart upload"));
        }
        let upload_id = Uuid::new_v4().simple().to_string();
        self.uploads.insert(upload_id.clone(), PendingUpload {
            key: key.to_owned(),
            parts: BTreeMap::new(),
        });
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        is_last: bool,
    ) -> Result<CompletedPart, ClientError> {
        let size = body.len() as u64;
        self.record(ClientCall::UploadPart {
            key: key.to_owned(),
            part_number,
            size,
            is_last,
        });
        if self.faults.lock().failing_parts.contains(&part_number) {
            return Err(injected("upload part"));
        }
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let etag = compute_etag(&body);
        upload.parts.insert(part_number, StagedPart {
            data: body,
            etag: etag.clone(),
        });
        Ok(CompletedPart {
            part_number,
            size,
            etag,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError> {
        self.record(ClientCall::CompleteMultipart {
            key: key.to_owned(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        if self.faults.lock().fail_complete {
            return Err(injected("complete multipart upload"));
        }
        if parts.is_empty() {
            return Err(ClientError::service(
                400,
                "MalformedXML",
                "the part list must not be empty",
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(ClientError::service(
                400,
                "InvalidPartOrder",
                "the part list was not in ascending order",
            ));
        }

        let (data, etag) = {
            let upload = self
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| no_such_upload(upload_id))?;
            let mut data = BytesMut::new();
            let mut part_md5s = Vec::with_capacity(parts.len());
            for part in parts {
                let staged = upload
                    .parts
                    .get(&part.part_number)
                    .filter(|s| s.etag == part.etag)
                    .ok_or_else(|| {
                        ClientError::service(
                            400,
                            "InvalidPart",
                            format!("part {} was not uploaded", part.part_number),
                        )
                    })?;
                data.extend_from_slice(&staged.data);
                part_md5s.push(staged.etag.trim_matches('"').to_owned());
            }
            (data.freeze(), compute_multipart_etag(&part_md5s))
        };

        self.uploads.remove(upload_id);
        self.objects
            .write()
            .insert(key.to_owned(), StoredObject { data, etag });
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ClientError> {
        self.record(ClientCall::AbortMultipart {
            key: key.to_owned(),
        });
        if self.faults.lock().fail_abort {
            return Err(injected("abort multipart upload"));
        }
        self.uploads
            .remove(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        self.aborted_uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_objects(
        &self,
        keys: &[String],
        quiet: bool,
    ) -> Result<Vec<DeleteFailure>, ClientError> {
        self.record(ClientCall::DeleteObjects {
            keys: keys.to_vec(),
            quiet,
        });
        let call = self.delete_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if keys.len() > MAX_BULK_DELETES {
            return Err(ClientError::service(
                400,
                "MalformedXML",
                format!("at most {MAX_BULK_DELETES} keys per request"),
            ));
        }

        let (refused, report_missing) = {
            let faults = self.faults.lock();
            if faults.failing_delete_calls.contains(&call) {
                return Err(ClientError::transport(format!(
                    "injected failure of delete call {call}"
                )));
            }
            (faults.refused_deletes.clone(), faults.report_missing_keys)
        };

        let mut failures = Vec::new();
        let mut objects = self.objects.write();
        for key in keys {
            if let Some(code) = refused.get(key) {
                failures.push(DeleteFailure::new(key, code, "injected delete failure"));
            } else if objects.remove(key).is_none() && report_missing {
                failures.push(DeleteFailure::new(
                    key,
                    "NoSuchKey",
                    "The specified key does not exist.",
                ));
            }
        }
        Ok(failures)
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, ClientError> {
        self.record(ClientCall::List {
            prefix: request.prefix.clone(),
            delimiter: request.delimiter.clone(),
            continued: request.continuation.is_some(),
        });
        self.list_page(request)
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryBody {
    data: Bytes,
    chunk_size: usize,
    fail_after: Option<u64>,
    aborted: bool,
    aborts: Arc<AtomicUsize>,
}

#[async_trait]
impl BodyStream for MemoryBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.aborted {
            return Ok(None);
        }
        if self.fail_after == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected connection reset",
            ));
        }
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut take = self.chunk_size.min(self.data.len());
        if let Some(limit) = self.fail_after {
            take = take.min(usize::try_from(limit).unwrap_or(usize::MAX));
            self.fail_after = Some(limit - take as u64);
        }
        Ok(Some(self.data.split_to(take)))
    }

    fn abort(&mut self) {
        if !self.aborted {
            self.aborted = true;
            self.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn slice_range(data: &Bytes, range: ByteRange) -> Result<Bytes, ClientError> {
    let len = data.len() as u64;
    if range.start() >= len {
        return Err(ClientError::service(
            416,
            "InvalidRange",
            format!("range {range} is not satisfiable for length {len}"),
        ));
    }
    let end = range.end().map_or(len - 1, |end| end.min(len - 1));
    let start = usize::try_from(range.start()).map_err(ClientError::transport)?;
    let end = usize::try_from(end).map_err(ClientError::transport)?;
    Ok(data.slice(start..=end))
}

/// One page of a delimiter listing over keys in ascending order.
///
/// Objects and common prefixes both count toward `max_entries`. The token of
/// a truncated page encodes the last entry returned; keys under a common
/// prefix used as the marker are skipped on the next page.
fn list_sorted<'a>(
    entries: impl Iterator<Item = (&'a str, u64)>,
    prefix: &str,
    delimiter: Option<&str>,
    marker: Option<&str>,
    max_entries: usize,
) -> ListPage {
    let marker_prefix = marker.filter(|m| {
        delimiter.is_some_and(|d| m.strip_prefix(prefix).is_some_and(|rest| rest.contains(d)))
    });

    let mut page = ListPage::default();
    let mut count = 0usize;
    let mut last_entry: Option<String> = None;
    let mut truncated = false;

    for (key, size) in entries {
        if marker.is_some_and(|m| key <= m) {
            continue;
        }
        if marker_prefix.is_some_and(|m| key.starts_with(m)) {
            continue;
        }

        if let Some(delimiter) = delimiter {
            let after_prefix = &key[prefix.len()..];
            if let Some(pos) = after_prefix.find(delimiter) {
                let cp = format!(
                    "{prefix}{}",
                    &after_prefix[..pos + delimiter.len()]
                );
                if page.common_prefixes.last() == Some(&cp) {
                    continue;
                }
                if count >= max_entries {
                    truncated = true;
                    break;
                }
                last_entry = Some(cp.clone());
                page.common_prefixes.push(cp);
                count += 1;
                continue;
            }
        }

        if count >= max_entries {
            truncated = true;
            break;
        }
        page.objects.push(ObjectSummary {
            key: key.to_owned(),
            size,
        });
        last_entry = Some(key.to_owned());
        count += 1;
    }

    if truncated {
        page.next_continuation = last_entry.as_deref().map(encode_continuation_token);
    }
    page
}

fn encode_continuation_token(key: &str) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}

fn decode_continuation_token(token: &str) -> Result<String, ClientError> {
    let bytes = BASE64_STANDARD
        .decode(token)
        .map_err(|_| ClientError::service(400, "InvalidArgument", "Invalid continuation token"))?;
    String::from_utf8(bytes).map_err(|_| {
        ClientError::service(
            400,
            "InvalidArgument",
            "Continuation token contains invalid UTF-8",
        )
    })
}

fn compute_etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn compute_multipart_etag(part_md5_hexes: &[String]) -> String {
    let mut combined = Vec::with_capacity(part_md5_hexes.len() * 16);
    for hex_str in part_md5_hexes {
        if let Ok(bytes) = hex::decode(hex_str) {
            combined.extend_from_slice(&bytes);
        }
    }
    let final_md5 = hex::encode(Md5::digest(&combined));
    format!("\"{final_md5}-{}\"", part_md5_hexes.len())
}

fn no_such_key(key: &str) -> ClientError {
    ClientError::service(
        404,
        "NoSuchKey",
        format!("The specified key does not exist: {key}"),
    )
}

fn no_such_upload(upload_id: &str) -> ClientError {
    ClientError::service(
        404,
        "NoSuchUpload",
        format!("The specified upload does not exist: {upload_id}"),
    )
}

fn injected(operation: &str) -> ClientError {
    ClientError::service(500, "InternalError", format!("injected {operation} failure"))
}
