//! The object-store boundary.
//!
//! Every store round-trip made by the engine goes through [`ObjectClient`].
//! A client is scoped to one bucket, is `Send + Sync`, and is shared behind
//! an [`Arc`](std::sync::Arc) by the store, its containers, readers and
//! writers.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{ClientError, DeleteFailure},
    key::ByteRange,
};

/// A streaming object body.
#[async_trait]
pub trait BodyStream: Send {
    /// The next chunk of the body, or `None` at end of stream.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Stop the transfer without draining the remaining bytes.
    fn abort(&mut self);
}

/// An opened object, possibly restricted to a range.
pub struct ObjectBody {
    /// The body stream.
    pub stream: Box<dyn BodyStream>,
    /// Number of bytes the stream declares it will deliver.
    pub content_length: u64,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// A part accepted by the store, with its completion tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Part size in bytes.
    pub size: u64,
    /// Completion tag returned by the store.
    pub etag: String,
}

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Fully-qualified key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Parameters of one listing page request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Only keys starting with this prefix are listed.
    pub prefix: String,
    /// Roll keys up to common prefixes at this delimiter.
    pub delimiter: Option<String>,
    /// Token returned by the previous page.
    pub continuation: Option<String>,
}

impl ListRequest {
    /// A request for the first page under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: None,
            continuation: None,
        }
    }

    /// Set the delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    /// Set the continuation token.
    #[must_use]
    pub fn with_continuation(mut self, token: Option<String>) -> Self {
        self.continuation = token;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page.
    pub objects: Vec<ObjectSummary>,
    /// Common prefixes on this page, each ending with the delimiter.
    pub common_prefixes: Vec<String>,
    /// Token for the next page, `None` when the listing is complete.
    pub next_continuation: Option<String>,
}

/// Capability over one bucket of an object store.
///
/// Every call is independently atomic; there is no cross-object transaction
/// and listings are only eventually consistent. Implementations report a
/// provider answer as [`ClientError::Service`] and anything else as
/// [`ClientError::Transport`].
#[async_trait]
pub trait ObjectClient: Send + Sync + fmt::Debug {
    /// The bucket this client addresses.
    fn bucket(&self) -> &str;

    /// A short human-readable location, e.g. `region/bucket`.
    fn describe(&self) -> String {
        self.bucket().to_owned()
    }

    /// Whether an object exists at `key`.
    async fn object_exists(&self, key: &str) -> Result<bool, ClientError>;

    /// Open the object at `key`, optionally restricted to `range`.
    async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody, ClientError>;

    /// Store `body` at `key` in one request, returning the object's tag.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<String, ClientError>;

    /// Start a multipart upload, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String, ClientError>;

    /// Upload one part of a multipart upload.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        is_last: bool,
    ) -> Result<CompletedPart, ClientError>;

    /// Assemble the uploaded parts into the final object.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError>;

    /// Discard a multipart upload and its staged parts.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ClientError>;

    /// Delete up to one provider batch of keys.
    ///
    /// In quiet mode only the keys that failed are reported.
    async fn delete_objects(
        &self,
        keys: &[String],
        quiet: bool,
    ) -> Result<Vec<DeleteFailure>, ClientError>;

    /// Fetch one page of a listing.
    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, ClientError>;
}
