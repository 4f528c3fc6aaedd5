//! End-to-end tests for the blobrepo engine.
//!
//! Most scenarios run against [`InMemoryObjectClient`] and need nothing
//! external. Tests against a live S3-compatible endpoint are marked
//! `#[ignore]`; run them with:
//!
//! ```text
//! S3_ENDPOINT_URL=http://localhost:4566 cargo test -p blobrepo-integration -- --ignored
//! ```

use std::sync::{Arc, Once};

use blobrepo_core::{BlobStore, InMemoryObjectClient, RepositoryConfig, config::MIB};
use blobrepo_s3::{ClientSettings, S3ObjectClient};

static INIT: Once = Once::new();

/// Initialize tracing (once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// Generate a unique name for a test bucket or container.
#[must_use]
pub fn unique_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
    format!("test-{prefix}-{id}")
}

/// Deterministic test payload of `len` bytes.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A repository configuration for `bucket` with the given buffer size.
#[must_use]
pub fn repository_config(bucket: &str, buffer_size: u64) -> RepositoryConfig {
    RepositoryConfig::builder()
        .bucket(bucket.to_owned())
        .base_path("repo".into())
        .buffer_size(buffer_size)
        .build()
}

/// A store over a fresh in-memory bucket.
#[must_use]
pub fn memory_store(buffer_size: u64) -> (Arc<InMemoryObjectClient>, BlobStore) {
    memory_store_with(
        InMemoryObjectClient::new("repo-bucket"),
        repository_config("repo-bucket", buffer_size),
    )
}

/// A store over `client` with `config`.
#[must_use]
pub fn memory_store_with(
    client: InMemoryObjectClient,
    config: RepositoryConfig,
) -> (Arc<InMemoryObjectClient>, BlobStore) {
    init_tracing();
    let client = Arc::new(client);
    let store = BlobStore::new(client.clone(), config)
        .unwrap_or_else(|e| panic!("failed to create store: {e}"));
    (client, store)
}

// ---------------------------------------------------------------------------
// Live endpoint helpers
// ---------------------------------------------------------------------------

/// Endpoint URL of the live S3-compatible server.
fn endpoint_url() -> String {
    std::env::var("S3_ENDPOINT_URL").unwrap_or_else(|_| "http://localhost:4566".to_owned())
}

/// Settings pointing at the live server.
#[must_use]
pub fn live_settings() -> ClientSettings {
    ClientSettings::builder()
        .region("us-east-1".into())
        .endpoint(Some(endpoint_url()))
        .access_key_id(Some("test".into()))
        .secret_access_key(Some("test".into()))
        .force_path_style(true)
        .build()
}

/// Create a bucket on the live server and a store over it.
pub async fn live_store() -> (S3ObjectClient, BlobStore) {
    init_tracing();
    let bucket = unique_name("blobrepo");
    let client = S3ObjectClient::from_settings(&live_settings(), &bucket)
        .await
        .unwrap_or_else(|e| panic!("failed to build client: {e}"));
    client
        .sdk()
        .create_bucket()
        .bucket(&bucket)
        .send()
        .await
        .unwrap_or_else(|e| panic!("failed to create bucket {bucket}: {e}"));
    tracing::info!(%bucket, "created test bucket");
    let store = BlobStore::new(Arc::new(client.clone()), repository_config(&bucket, 5 * MIB))
        .unwrap_or_else(|e| panic!("failed to create store: {e}"));
    (client, store)
}

/// Delete all objects and pending uploads in the client's bucket, then the
/// bucket itself.
pub async fn cleanup_bucket(client: &S3ObjectClient) {
    use blobrepo_core::ObjectClient;

    let sdk = client.sdk();
    let bucket = client.bucket();
    let mut continuation_token = None;
    loop {
        let mut req = sdk.list_objects_v2().bucket(bucket);
        if let Some(token) = continuation_token.take() {
            req = req.continuation_token(token);
        }
        let Ok(resp) = req.send().await else {
            return;
        };

        for obj in resp.contents() {
            if let Some(key) = obj.key() {
                let _ = sdk.delete_object().bucket(bucket).key(key).send().await;
            }
        }

        if resp.is_truncated() == Some(true) {
            continuation_token = resp.next_continuation_token().map(ToOwned::to_owned);
        } else {
            break;
        }
    }

    if let Ok(uploads) = sdk.list_multipart_uploads().bucket(bucket).send().await {
        for upload in uploads.uploads() {
            if let (Some(key), Some(id)) = (upload.key(), upload.upload_id()) {
                tracing::info!(key, upload_id = id, "aborting leftover multipart upload");
                let _ = sdk
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(id)
                    .send()
                    .await;
            }
        }
    }

    let _ = sdk.delete_bucket().bucket(bucket).send().await;
}

mod test_delete;
mod test_listing;
mod test_read;
mod test_upload;
