//! Repository configuration.
//!
//! Provides [`RepositoryConfig`] for the bucket layout and engine tunables,
//! and [`UploadLimits`] for the provider's upload size limits. Values are
//! loaded from environment variables via [`RepositoryConfig::from_env`] and
//! checked once with [`RepositoryConfig::validate`].

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// One kibibyte.
pub const KIB: u64 = 1024;
/// One mebibyte.
pub const MIB: u64 = 1024 * KIB;
/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;
/// One tebibyte.
pub const TIB: u64 = 1024 * GIB;

/// Default part size and single-upload threshold.
pub const DEFAULT_BUFFER_SIZE: u64 = 100 * MIB;
/// Smallest accepted buffer size.
pub const MIN_BUFFER_SIZE: u64 = 5 * MIB;
/// Largest accepted buffer size.
pub const MAX_BUFFER_SIZE: u64 = 5 * GIB;
/// Default number of read attempts, including the first one.
pub const DEFAULT_MAX_READ_ATTEMPTS: u32 = 11;
/// Largest number of keys the provider accepts in one bulk delete.
pub const MAX_BULK_DELETES: usize = 1000;

/// Errors raised while validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No bucket name was configured.
    #[error("bucket name is required")]
    MissingBucket,

    /// A numeric setting lies outside its accepted range.
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Configured value.
        value: u64,
        /// Lower bound, inclusive.
        min: u64,
        /// Upper bound, inclusive.
        max: u64,
    },

    /// A required setting is missing or malformed.
    #[error("invalid setting {name}: {message}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// UploadLimits
// ---------------------------------------------------------------------------

/// Provider limits enforced by the upload paths.
///
/// Defaults match the provider; tests inject smaller values to exercise the
/// multipart path with small payloads.
///
/// # Examples
///
/// ```
/// use blobrepo_core::config::{GIB, MIB, UploadLimits};
///
/// let limits = UploadLimits::default();
/// assert_eq!(limits.max_single_upload, 5 * GIB);
/// assert_eq!(limits.min_multipart_size, 5 * MIB);
/// assert_eq!(limits.max_parts, 10_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct UploadLimits {
    /// Largest object a single put may carry.
    #[builder(default = 5 * GIB)]
    pub max_single_upload: u64,

    /// Smallest object that may be written with a multipart upload.
    #[builder(default = 5 * MIB)]
    pub min_multipart_size: u64,

    /// Largest object a multipart upload may produce.
    #[builder(default = 5 * TIB)]
    pub max_multipart_size: u64,

    /// Largest number of parts in one multipart upload.
    #[builder(default = 10_000)]
    pub max_parts: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_single_upload: 5 * GIB,
            min_multipart_size: 5 * MIB,
            max_multipart_size: 5 * TIB,
            max_parts: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// RepositoryConfig
// ---------------------------------------------------------------------------

/// Repository layout and engine configuration.
///
/// # Examples
///
/// ```
/// use blobrepo_core::config::RepositoryConfig;
///
/// let config = RepositoryConfig::builder()
///     .bucket("snapshots".into())
///     .app_id(Some("1250000000".into()))
///     .build();
/// assert_eq!(config.effective_bucket(), "snapshots-1250000000");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Bucket holding the repository.
    #[builder(default)]
    pub bucket: String,

    /// Legacy application id, appended to the bucket name as `bucket-appid`.
    #[builder(default)]
    pub app_id: Option<String>,

    /// Key prefix under which the repository lives.
    #[builder(default)]
    pub base_path: String,

    /// Part size for chunked uploads and threshold for single puts.
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: u64,

    /// Read attempts per reader, including the first one.
    #[builder(default = DEFAULT_MAX_READ_ATTEMPTS)]
    pub max_read_attempts: u32,

    /// Keys per bulk-delete round-trip.
    #[builder(default = MAX_BULK_DELETES)]
    pub bulk_delete_batch_size: usize,

    /// Log level filter string (e.g. `"info"`, `"debug"`).
    #[builder(default = String::from("info"))]
    pub log_level: String,

    /// Provider upload limits.
    #[builder(default)]
    #[serde(default)]
    pub limits: UploadLimits,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            app_id: None,
            base_path: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
            bulk_delete_batch_size: MAX_BULK_DELETES,
            log_level: String::from("info"),
            limits: UploadLimits::default(),
        }
    }
}

impl RepositoryConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads the following environment variables (falling back to defaults):
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BLOBREPO_BUCKET` | (empty) |
    /// | `BLOBREPO_APP_ID` | (unset) |
    /// | `BLOBREPO_BASE_PATH` | (empty) |
    /// | `BLOBREPO_BUFFER_SIZE` | `100mb` |
    /// | `BLOBREPO_MAX_READ_ATTEMPTS` | `11` |
    /// | `BLOBREPO_BULK_DELETE_BATCH_SIZE` | `1000` |
    /// | `LOG_LEVEL` | `info` |
    ///
    /// Malformed numeric values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("BLOBREPO_BUCKET") {
            config.bucket = v;
        }
        if let Ok(v) = std::env::var("BLOBREPO_APP_ID") {
            if !v.is_empty() {
                config.app_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BLOBREPO_BASE_PATH") {
            config.base_path = v;
        }
        if let Ok(v) = std::env::var("BLOBREPO_BUFFER_SIZE") {
            match parse_byte_size(&v) {
                Some(n) => config.buffer_size = n,
                None => tracing::warn!(value = %v, "ignoring malformed BLOBREPO_BUFFER_SIZE"),
            }
        }
        if let Ok(v) = std::env::var("BLOBREPO_MAX_READ_ATTEMPTS") {
            match v.parse::<u32>() {
                Ok(n) => config.max_read_attempts = n,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring malformed BLOBREPO_MAX_READ_ATTEMPTS");
                }
            }
        }
        if let Ok(v) = std::env::var("BLOBREPO_BULK_DELETE_BATCH_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => config.bulk_delete_batch_size = n,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring malformed BLOBREPO_BULK_DELETE_BATCH_SIZE");
                }
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }

    /// Check every setting against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket);
        }
        check_range(
            "buffer_size",
            self.buffer_size,
            MIN_BUFFER_SIZE,
            MAX_BUFFER_SIZE,
        )?;
        check_range(
            "max_read_attempts",
            u64::from(self.max_read_attempts),
            1,
            u64::from(u32::MAX),
        )?;
        check_range(
            "bulk_delete_batch_size",
            self.bulk_delete_batch_size as u64,
            1,
            MAX_BULK_DELETES as u64,
        )?;
        if self.limits.max_parts == 0 {
            return Err(ConfigError::Invalid {
                name: "limits.max_parts",
                message: "must be greater than zero".to_owned(),
            });
        }
        if self.limits.min_multipart_size > self.limits.max_multipart_size {
            return Err(ConfigError::Invalid {
                name: "limits.min_multipart_size",
                message: "must not exceed limits.max_multipart_size".to_owned(),
            });
        }
        Ok(())
    }

    /// The bucket name actually addressed, with the legacy app id appended.
    #[must_use]
    pub fn effective_bucket(&self) -> String {
        match self.app_id.as_deref() {
            Some(app_id) if !app_id.is_empty() => format!("{}-{app_id}", self.bucket),
            _ => self.bucket.clone(),
        }
    }

    /// The base path with any leading `/` removed.
    #[must_use]
    pub fn effective_base_path(&self) -> &str {
        self.base_path.trim_start_matches('/')
    }

    /// Log a deprecation warning for every legacy setting in use.
    pub fn warn_deprecated(&self) {
        if self.app_id.as_deref().is_some_and(|id| !id.is_empty()) {
            tracing::warn!(
                bucket = %self.bucket,
                "app_id is deprecated, include it in the bucket name instead"
            );
        }
        if self.base_path.starts_with('/') {
            tracing::warn!(
                base_path = %self.base_path,
                "base_path should not start with '/', the leading slash is ignored"
            );
        }
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Parse a byte size such as `"5mb"`, `"100MB"` or `"1024"`.
///
/// Accepted suffixes are `b`, `kb`, `mb`, `gb` and `tb` (case-insensitive,
/// powers of 1024). Returns `None` for malformed or overflowing values.
///
/// # Examples
///
/// ```
/// use blobrepo_core::config::{MIB, parse_byte_size};
///
/// assert_eq!(parse_byte_size("100mb"), Some(100 * MIB));
/// assert_eq!(parse_byte_size("42"), Some(42));
/// assert_eq!(parse_byte_size("lots"), None);
/// ```
#[must_use]
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let lower = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = [("tb", TIB), ("gb", GIB), ("mb", MIB), ("kb", KIB), ("b", 1)]
        .iter()
        .find_map(|(suffix, mult)| lower.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((lower.as_str(), 1));
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}
