//! Blob repository engine over an object-storage bucket.
//!
//! This crate stores snapshot blobs as objects in one bucket. Blobs are
//! grouped into containers addressed by `/`-separated key prefixes. Reads
//! resume transparently after connection failures, large writes go through
//! multipart uploads, and deletions are batched into bulk requests.
//!
//! # Architecture
//!
//! ```text
//!   BlobStore (client + RepositoryConfig)
//!        |
//!        v
//!   BlobContainer (key prefix)
//!        |
//!        +--> RetryingRangeReader   (resumable ranged reads)
//!        +--> upload_sized / ChunkedUploadWriter (single or multipart)
//!        +--> BulkDeleteCoordinator (batched deletes)
//!        +--> ListingWalker         (paged listings)
//!        |
//!        v
//!   ObjectClient (S3 adapter or InMemoryObjectClient)
//! ```

pub mod client;
pub mod config;
pub mod container;
pub mod delete;
pub mod error;
pub mod key;
pub mod listing;
pub mod memory;
pub mod reader;
pub mod store;
pub mod upload;

pub use client::{
    BodyStream, CompletedPart, ListPage, ListRequest, ObjectBody, ObjectClient, ObjectSummary,
};
pub use config::{ConfigError, RepositoryConfig, UploadLimits};
pub use container::{BlobContainer, BlobMetadata, DeleteResult};
pub use delete::{BulkDeleteCoordinator, DeleteOutcome};
pub use error::{
    BatchDeleteError, BlobStoreError, BlobStoreResult, ClientError, DeleteFailure,
    SuppressedErrors,
};
pub use key::{BlobPath, ByteRange, ObjectKey};
pub use listing::ListingWalker;
pub use memory::{ClientCall, InMemoryObjectClient};
pub use reader::RetryingRangeReader;
pub use store::BlobStore;
pub use upload::{ChunkedUploadWriter, upload_sized};
