//! S3 client settings and the reloadable settings registry.

use std::{fmt, sync::Arc};

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use blobrepo_core::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Connection settings for one S3-compatible endpoint.
///
/// Static credentials are optional; without them the default AWS provider
/// chain is used.
///
/// # Examples
///
/// ```
/// use blobrepo_s3::ClientSettings;
///
/// let settings = ClientSettings::builder()
///     .region("ap-guangzhou".into())
///     .access_key_id(Some("AKID".into()))
///     .secret_access_key(Some("very-secret".into()))
///     .build();
/// assert!(settings.validate().is_ok());
/// assert!(!format!("{settings:?}").contains("very-secret"));
/// ```
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// Region the bucket lives in.
    #[builder(default)]
    pub region: String,

    /// Custom endpoint URL, for S3-compatible providers.
    #[builder(default)]
    pub endpoint: Option<String>,

    /// Static access key id.
    #[builder(default)]
    pub access_key_id: Option<String>,

    /// Static secret access key.
    #[builder(default)]
    pub secret_access_key: Option<String>,

    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    #[builder(default)]
    pub force_path_style: bool,
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl ClientSettings {
    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BLOBREPO_REGION` | (empty) |
    /// | `BLOBREPO_ENDPOINT` | (unset) |
    /// | `BLOBREPO_ACCESS_KEY_ID` | (unset) |
    /// | `BLOBREPO_SECRET_ACCESS_KEY` | (unset) |
    /// | `BLOBREPO_FORCE_PATH_STYLE` | `false` |
    #[must_use]
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            region: std::env::var("BLOBREPO_REGION").unwrap_or_default(),
            endpoint: non_empty("BLOBREPO_ENDPOINT"),
            access_key_id: non_empty("BLOBREPO_ACCESS_KEY_ID"),
            secret_access_key: non_empty("BLOBREPO_SECRET_ACCESS_KEY"),
            force_path_style: std::env::var("BLOBREPO_FORCE_PATH_STYLE")
                .ok()
                .is_some_and(|v| parse_bool(&v)),
        }
    }

    /// Check that a region is set and that credentials come in pairs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "region",
                message: "a region is required".to_owned(),
            });
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ConfigError::Invalid {
                name: "access_key_id",
                message: "access key id and secret access key must be set together".to_owned(),
            });
        }
        Ok(())
    }

    /// Build an SDK client from these settings.
    ///
    /// Without static credentials, the default provider chain is loaded.
    pub async fn build_sdk_client(&self) -> Result<aws_sdk_s3::Client, ConfigError> {
        self.validate()?;
        let region = Region::new(self.region.clone());

        let mut builder = match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) => {
                let creds = Credentials::new(key, secret, None, None, "blobrepo-settings");
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(creds)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(self.force_path_style);

        Ok(aws_sdk_s3::Client::from_conf(builder.build()))
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds the current [`ClientSettings`] snapshot.
///
/// Snapshots are immutable: [`reload`](Self::reload) swaps in a new one, and
/// holders of an older snapshot keep seeing it unchanged.
#[derive(Debug)]
pub struct ClientSettingsRegistry {
    current: RwLock<Arc<ClientSettings>>,
}

impl ClientSettingsRegistry {
    /// Create a registry holding `settings`.
    pub fn new(settings: ClientSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(settings)),
        })
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ClientSettings> {
        Arc::clone(&self.current.read())
    }

    /// Replace the current snapshot, returning the previous one.
    ///
    /// Invalid settings are rejected and the current snapshot is kept.
    pub fn reload(&self, settings: ClientSettings) -> Result<Arc<ClientSettings>, ConfigError> {
        settings.validate()?;
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(settings));
        tracing::info!(region = %self.current.read().region, "reloaded client settings");
        Ok(previous)
    }
}
