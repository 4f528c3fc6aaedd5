//! The blob store: shared client plus immutable repository configuration.

use std::sync::Arc;

use crate::{
    client::ObjectClient,
    config::{ConfigError, RepositoryConfig},
    container::BlobContainer,
    key::BlobPath,
};

#[derive(Debug)]
struct StoreInner {
    client: Arc<dyn ObjectClient>,
    config: RepositoryConfig,
    base_path: BlobPath,
}

/// Hands out [`BlobContainer`]s over one bucket.
///
/// Cloning is cheap; clones share the client and configuration.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobrepo_core::{BlobPath, BlobStore, InMemoryObjectClient, RepositoryConfig};
///
/// let client = Arc::new(InMemoryObjectClient::new("snapshots"));
/// let config = RepositoryConfig::builder()
///     .bucket("snapshots".into())
///     .base_path("/prod".into())
///     .build();
/// let store = BlobStore::new(client, config).unwrap();
///
/// assert_eq!(store.bucket(), "snapshots");
/// assert_eq!(store.base_container().key_path(), "prod/");
/// assert_eq!(
///     store.blob_container(BlobPath::parse("prod/indices")).key_path(),
///     "prod/indices/"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct BlobStore {
    inner: Arc<StoreInner>,
}

impl BlobStore {
    /// Validate `config` and bind it to `client`.
    ///
    /// The client must address the configured bucket, including the legacy
    /// app id suffix.
    pub fn new(client: Arc<dyn ObjectClient>, config: RepositoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config.warn_deprecated();

        let bucket = config.effective_bucket();
        if client.bucket() != bucket {
            return Err(ConfigError::Invalid {
                name: "bucket",
                message: format!(
                    "client addresses bucket [{}] but the repository is configured for [{bucket}]",
                    client.bucket()
                ),
            });
        }

        let base_path = BlobPath::parse(config.effective_base_path());
        tracing::debug!(
            bucket = %bucket,
            base_path = %base_path,
            buffer_size = config.buffer_size,
            "created blob store"
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                client,
                config,
                base_path,
            }),
        })
    }

    /// The bucket holding the repository.
    #[must_use]
    pub fn bucket(&self) -> &str {
        self.inner.client.bucket()
    }

    /// A short description of where the store lives.
    #[must_use]
    pub fn describe(&self) -> String {
        self.inner.client.describe()
    }

    /// The shared client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ObjectClient> {
        &self.inner.client
    }

    /// The repository configuration.
    #[must_use]
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// The configured base path.
    #[must_use]
    pub fn base_path(&self) -> &BlobPath {
        &self.inner.base_path
    }

    /// The container at `path`.
    #[must_use]
    pub fn blob_container(&self, path: BlobPath) -> BlobContainer {
        BlobContainer::new(self.clone(), path)
    }

    /// The container at the configured base path.
    #[must_use]
    pub fn base_container(&self) -> BlobContainer {
        self.blob_container(self.inner.base_path.clone())
    }
}
