//! Key-space value types: [`BlobPath`], [`ObjectKey`] and [`ByteRange`].

use std::fmt;

use crate::error::{BlobStoreError, BlobStoreResult};

/// Separator between path segments in a key.
pub const SEPARATOR: char = '/';

// ---------------------------------------------------------------------------
// BlobPath
// ---------------------------------------------------------------------------

/// An ordered list of path segments naming a blob container.
///
/// # Examples
///
/// ```
/// use blobrepo_core::key::BlobPath;
///
/// let path = BlobPath::new().add("indices").add("abc");
/// assert_eq!(path.as_key_prefix(), "indices/abc/");
/// assert_eq!(BlobPath::new().as_key_prefix(), "");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BlobPath {
    segments: Vec<String>,
}

impl BlobPath {
    /// The empty (root) path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path, skipping empty segments.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split(SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// A new path with `segment` appended.
    #[must_use]
    pub fn add(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// The path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render as a key prefix: every segment followed by `/`.
    #[must_use]
    pub fn as_key_prefix(&self) -> String {
        let mut prefix = String::new();
        for segment in &self.segments {
            prefix.push_str(segment);
            prefix.push(SEPARATOR);
        }
        prefix
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key_prefix())
    }
}

// ---------------------------------------------------------------------------
// ObjectKey
// ---------------------------------------------------------------------------

/// A fully-qualified store key: container prefix plus blob name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Join a container prefix and a blob name.
    ///
    /// A leading separator on the name is dropped when the prefix already
    /// ends in one (or is empty), so the key never carries a doubled or
    /// leading `/`.
    ///
    /// # Examples
    ///
    /// ```
    /// use blobrepo_core::key::ObjectKey;
    ///
    /// assert_eq!(ObjectKey::join("a/b/", "c.dat").as_str(), "a/b/c.dat");
    /// assert_eq!(ObjectKey::join("a/", "/c.dat").as_str(), "a/c.dat");
    /// assert_eq!(ObjectKey::join("", "/c.dat").as_str(), "c.dat");
    /// ```
    #[must_use]
    pub fn join(prefix: &str, name: &str) -> Self {
        let name = if prefix.is_empty() || prefix.ends_with(SEPARATOR) {
            name.trim_start_matches(SEPARATOR)
        } else {
            name
        };
        let mut key = String::with_capacity(prefix.len() + name.len());
        key.push_str(prefix.trim_start_matches(SEPARATOR));
        key.push_str(name);
        Self(key)
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned key string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

// ---------------------------------------------------------------------------
// ByteRange
// ---------------------------------------------------------------------------

/// An inclusive byte range `[start, end]`, or `[start, ∞)` when unbounded.
///
/// # Examples
///
/// ```
/// use blobrepo_core::key::ByteRange;
///
/// let range = ByteRange::new(100, 199).unwrap();
/// assert_eq!(range.header_value(), "bytes=100-199");
/// assert_eq!(range.len(), Some(100));
///
/// assert!(ByteRange::new(10, 9).is_err());
/// assert!(ByteRange::new(0, u64::MAX).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl ByteRange {
    /// A bounded range. `end` must be `>= start` and below `u64::MAX`, which
    /// is reserved as the unbounded sentinel.
    pub fn new(start: u64, end: u64) -> BlobStoreResult<Self> {
        if end < start {
            return Err(BlobStoreError::invalid_argument(format!(
                "end must be >= start, got start [{start}] end [{end}]"
            )));
        }
        if end == u64::MAX {
            return Err(BlobStoreError::invalid_argument(
                "end must be < u64::MAX, use an unbounded range instead",
            ));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// The whole object.
    #[must_use]
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    /// Everything from `start` to the end of the object.
    #[must_use]
    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// The range covering `length` bytes at `position`; `None` when
    /// `length` is zero.
    pub fn with_length(position: u64, length: u64) -> BlobStoreResult<Option<Self>> {
        if length == 0 {
            return Ok(None);
        }
        let end = position.checked_add(length - 1).ok_or_else(|| {
            BlobStoreError::invalid_argument(format!(
                "range at position [{position}] with length [{length}] overflows"
            ))
        })?;
        Self::new(position, end).map(Some)
    }

    /// First byte of the range.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte of the range, inclusive, or `None` when unbounded.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Number of bytes covered, or `None` when unbounded.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Always `false`: a range covers at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether the range covers the whole object.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// The remainder of this range after `delivered` bytes.
    #[must_use]
    pub fn resume_after(&self, delivered: u64) -> Self {
        Self {
            start: self.start.saturating_add(delivered),
            end: self.end,
        }
    }

    /// The HTTP `Range` header value, e.g. `bytes=0-99` or `bytes=5-`.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}
