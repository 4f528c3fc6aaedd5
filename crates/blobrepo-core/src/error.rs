//! Error types for the blob-access engine.
//!
//! Two layers of errors exist:
//!
//! - [`ClientError`] is produced at the [`ObjectClient`](crate::client::ObjectClient)
//!   boundary. It distinguishes a definite answer from the provider
//!   ([`ClientError::Service`], carrying the HTTP status) from a failure where
//!   no answer was received ([`ClientError::Transport`]).
//! - [`BlobStoreError`] is what the readers, writers, delete coordinator and
//!   container facade surface to callers. Provider errors are wrapped with the
//!   operation context, never flattened to strings, so the root cause stays
//!   reachable through [`std::error::Error::source`].
//!
//! Operations that can fail several times before giving up (reader retries,
//! bulk-delete batches) keep every cause: the first becomes the primary
//! source and the rest are retained as suppressed errors.
//!
//! # Usage
//!
//! ```
//! use blobrepo_core::error::{BlobStoreError, ClientError};
//!
//! let err = ClientError::service(404, "NoSuchKey", "gone");
//! assert!(err.is_not_found());
//!
//! let err = BlobStoreError::invalid_argument("end must be >= start");
//! assert!(err.to_string().contains("end must be >= start"));
//! ```

use std::fmt;

/// Boxed error used for opaque transport causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// ClientError
// ---------------------------------------------------------------------------

/// Error returned by an [`ObjectClient`](crate::client::ObjectClient) call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The provider answered with an error response.
    #[error("service error {status} ({code}): {message}")]
    Service {
        /// HTTP status code of the response.
        status: u16,
        /// Provider error code, e.g. `NoSuchKey`.
        code: String,
        /// Human-readable message from the provider.
        message: String,
    },

    /// No response, or an ambiguous one: it is unknown which effects, if any,
    /// the request had.
    #[error("transport failure: {0}")]
    Transport(#[source] BoxError),
}

impl ClientError {
    /// Build a [`ClientError::Service`].
    #[must_use]
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a [`ClientError::Transport`] from any error or message.
    #[must_use]
    pub fn transport(cause: impl Into<BoxError>) -> Self {
        Self::Transport(cause.into())
    }

    /// Whether this is a 404-class response.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Service { status: 404, .. })
    }

    /// The HTTP status, when the provider answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            Self::Transport(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bulk delete failures
// ---------------------------------------------------------------------------

/// A single key the provider refused to delete in a quiet bulk delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    /// The fully-qualified key.
    pub key: String,
    /// Provider error code.
    pub code: String,
    /// Provider error message.
    pub message: String,
}

impl DeleteFailure {
    /// Create a new failure entry.
    #[must_use]
    pub fn new(key: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the key was already absent, which a delete treats as success.
    #[must_use]
    pub fn is_missing_key(&self) -> bool {
        self.code == "NoSuchKey"
    }
}

impl fmt::Display for DeleteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}][{}]", self.key, self.code, self.message)
    }
}

/// Failure of one bulk-delete round-trip.
#[derive(Debug, thiserror::Error)]
pub enum BatchDeleteError {
    /// The provider reported some keys of the batch as not deleted.
    #[error("failed to delete some blobs: {}", format_failures(.failures))]
    Partial {
        /// The keys that could not be deleted.
        failures: Vec<DeleteFailure>,
    },

    /// The request failed as a whole; no per-key information is available.
    #[error("bulk delete request failed")]
    Client(#[source] ClientError),
}

fn format_failures(failures: &[DeleteFailure]) -> String {
    let rendered: Vec<String> = failures.iter().map(ToString::to_string).collect();
    rendered.join(", ")
}

// ---------------------------------------------------------------------------
// SuppressedErrors
// ---------------------------------------------------------------------------

/// A primary error plus later errors that were suppressed behind it.
///
/// The first recorded error wins; every later one is kept in order so the
/// full failure history reaches the operator.
#[derive(Debug)]
pub struct SuppressedErrors<E> {
    primary: E,
    suppressed: Vec<E>,
}

impl<E> SuppressedErrors<E> {
    /// Start a chain with `primary` as the surfaced cause.
    #[must_use]
    pub fn new(primary: E) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    /// Use `error` as primary if no chain exists yet, otherwise suppress it.
    #[must_use]
    pub fn use_or_suppress(existing: Option<Self>, error: E) -> Self {
        match existing {
            Some(mut chain) => {
                chain.suppressed.push(error);
                chain
            }
            None => Self::new(error),
        }
    }

    /// The first recorded error.
    #[must_use]
    pub fn primary(&self) -> &E {
        &self.primary
    }

    /// Errors recorded after the primary one, oldest first.
    #[must_use]
    pub fn suppressed(&self) -> &[E] {
        &self.suppressed
    }

    /// Total number of recorded errors.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.suppressed.len()
    }

    /// Always `false`; a chain holds at least its primary error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over all errors, primary first.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        std::iter::once(&self.primary).chain(self.suppressed.iter())
    }
}

impl<E> fmt::Display for SuppressedErrors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "first of {} recorded failure(s), {} suppressed",
            self.len(),
            self.suppressed.len()
        )
    }
}

impl<E> std::error::Error for SuppressedErrors<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.primary)
    }
}

// ---------------------------------------------------------------------------
// BlobStoreError
// ---------------------------------------------------------------------------

/// Errors surfaced by the blob-access engine.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// The object does not exist.
    #[error("Blob object [{key}] not found")]
    NotFound {
        /// The key that was not found.
        key: String,
        /// The provider response, when the absence came from one.
        #[source]
        source: Option<ClientError>,
    },

    /// A bad range, bad part-size arithmetic, or a size violating provider
    /// limits.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The operation was invoked on a closed or already-terminal resource.
    #[error("Illegal state: {message}")]
    IllegalState {
        /// Description of the state violation.
        message: String,
    },

    /// The resource does not support this operation.
    #[error("{operation} is not supported: reads only move forward")]
    Unsupported {
        /// The rejected operation.
        operation: &'static str,
    },

    /// A provider call failed.
    #[error("{context}")]
    Client {
        /// What the engine was doing.
        context: String,
        /// The provider failure.
        #[source]
        source: ClientError,
    },

    /// Local I/O failed, e.g. the caller's source stream.
    #[error("{context}")]
    Io {
        /// What the engine was doing.
        context: String,
        /// The I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A resumable read ran out of attempts.
    #[error("failed reading [{key}] at offset [{offset}], giving up after {attempts} attempts")]
    ReadExhausted {
        /// The key being read.
        key: String,
        /// Absolute object offset where the last failure happened.
        offset: u64,
        /// Attempts made, including the first.
        attempts: u32,
        /// The last failure.
        #[source]
        source: std::io::Error,
        /// Earlier failures, oldest first.
        suppressed: Vec<std::io::Error>,
    },

    /// A resumable read failed and the follow-up range request failed too.
    #[error("failed reopening [{key}] at offset [{offset}] after {attempts} attempts")]
    ReopenFailed {
        /// The key being read.
        key: String,
        /// Absolute object offset the reopen started from.
        offset: u64,
        /// Attempts made, including the first.
        attempts: u32,
        /// Why the reopen failed.
        #[source]
        source: Box<BlobStoreError>,
        /// Read failures that led to the reopen, oldest first.
        suppressed: Vec<std::io::Error>,
    },

    /// Keys remained outstanding after every bulk-delete batch was tried.
    #[error("Failed to delete blobs {sample:?} ({outstanding} outstanding)")]
    Delete {
        /// Up to ten of the outstanding keys.
        sample: Vec<String>,
        /// Number of outstanding keys.
        outstanding: usize,
        /// Every batch failure, first one primary.
        #[source]
        source: SuppressedErrors<BatchDeleteError>,
    },
}

impl BlobStoreError {
    /// Build an [`BlobStoreError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Build an [`BlobStoreError::IllegalState`].
    #[must_use]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Wrap a provider failure with context.
    #[must_use]
    pub fn client(context: impl Into<String>, source: ClientError) -> Self {
        Self::Client {
            context: context.into(),
            source,
        }
    }

    /// Wrap a local I/O failure with context.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error reports a missing object, including one that
    /// disappeared while a read was reopening it.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::ReopenFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Convenience result type for engine operations.
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;
