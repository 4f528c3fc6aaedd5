//! blobrepo-verify - check a blob repository end to end.
//!
//! Writes a scratch container through both upload paths, reads it back
//! whole and by range, lists it, then deletes it.
//!
//! # Usage
//!
//! ```text
//! BLOBREPO_BUCKET=snapshots BLOBREPO_REGION=us-east-1 blobrepo-verify
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BLOBREPO_BUCKET` | *(required)* | Bucket holding the repository |
//! | `BLOBREPO_APP_ID` | *(unset)* | Legacy app id appended to the bucket |
//! | `BLOBREPO_BASE_PATH` | *(empty)* | Key prefix of the repository |
//! | `BLOBREPO_BUFFER_SIZE` | `100mb` | Part size and single-put threshold |
//! | `BLOBREPO_REGION` | *(required)* | Bucket region |
//! | `BLOBREPO_ENDPOINT` | *(unset)* | Custom S3-compatible endpoint |
//! | `BLOBREPO_ACCESS_KEY_ID` | *(unset)* | Static access key id |
//! | `BLOBREPO_SECRET_ACCESS_KEY` | *(unset)* | Static secret key |
//! | `BLOBREPO_FORCE_PATH_STYLE` | `false` | Path-style bucket addressing |
//! | `LOG_LEVEL` | `info` | Log level filter |
//! | `RUST_LOG` | *(unset)* | Fine-grained tracing filter (overrides `LOG_LEVEL`) |

use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use blobrepo_core::{BlobContainer, BlobStore, DeleteResult, RepositoryConfig};
use blobrepo_s3::{ClientSettings, ClientSettingsRegistry, S3ObjectClient};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bytes handed to the chunked writer per call.
const WRITE_CHUNK: usize = 1024 * 1024;

/// Length of the ranged read-back.
const RANGE_LENGTH: u64 = 4096;

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config value.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// What a verification run did.
#[derive(Debug)]
struct Report {
    container: String,
    blobs_written: u64,
    bytes_written: u64,
    deleted: DeleteResult,
}

/// A payload one and a half buffers long, so both upload paths go multipart.
fn payload(buffer_size: u64) -> Result<Bytes> {
    let len = usize::try_from(buffer_size + buffer_size / 2)
        .context("buffer size does not fit in memory")?;
    Ok((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into())
}

async fn read_back(container: &BlobContainer, name: &str, expected: &[u8]) -> Result<()> {
    let mut reader = container
        .read_blob(name)
        .await
        .with_context(|| format!("failed to open [{name}]"))?;
    let data = reader
        .read_to_end()
        .await
        .with_context(|| format!("failed to read [{name}]"))?;
    ensure!(
        data == expected,
        "blob [{name}] read back {} bytes that differ from the {} written",
        data.len(),
        expected.len()
    );

    let position = expected.len() as u64 / 3;
    let mut reader = container
        .read_blob_range(name, position, RANGE_LENGTH)
        .await
        .with_context(|| format!("failed to open range of [{name}]"))?;
    let data = reader
        .read_to_end()
        .await
        .with_context(|| format!("failed to read range of [{name}]"))?;
    let start = usize::try_from(position)?;
    let end = usize::try_from(position + RANGE_LENGTH)?;
    ensure!(
        data == expected[start..end],
        "range [{position}, +{RANGE_LENGTH}) of [{name}] differs"
    );
    Ok(())
}

/// Run the verification against `store` in a fresh scratch container.
async fn verify(store: &BlobStore) -> Result<Report> {
    let name = format!("tests-{}", uuid::Uuid::new_v4().simple());
    let container = store.blob_container(store.base_path().add(name));
    let data = payload(store.config().buffer_size)?;
    let size = data.len() as u64;
    info!(container = %container.key_path(), size, "writing verification blobs");

    container
        .write_blob("sized.dat", &data[..], size, true)
        .await
        .context("sized write failed")?;

    let chunks = data.clone();
    container
        .write_blob_with("streamed.dat", true, false, move |writer| {
            Box::pin(async move {
                for chunk in chunks.chunks(WRITE_CHUNK) {
                    writer.write(chunk).await?;
                }
                Ok(())
            })
        })
        .await
        .context("chunked write failed")?;

    for blob in ["sized.dat", "streamed.dat"] {
        read_back(&container, blob, &data).await?;
    }

    let listed = container.list_blobs().await.context("listing failed")?;
    for blob in ["sized.dat", "streamed.dat"] {
        match listed.get(blob) {
            Some(meta) if meta.length == size => {}
            Some(meta) => bail!("[{blob}] listed with {} bytes, expected {size}", meta.length),
            None => bail!("[{blob}] missing from listing"),
        }
    }

    let deleted = container.delete().await.context("container delete failed")?;
    let remaining = container.list_blobs().await.context("listing failed")?;
    ensure!(
        remaining.is_empty(),
        "{} blobs left after deleting the container",
        remaining.len()
    );

    Ok(Report {
        container: container.key_path().to_owned(),
        blobs_written: 2,
        bytes_written: 2 * size,
        deleted,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RepositoryConfig::from_env();
    init_tracing(&config.log_level)?;

    let registry = ClientSettingsRegistry::new(ClientSettings::from_env())
        .context("invalid client settings")?;
    let client = S3ObjectClient::from_settings(&registry.snapshot(), config.effective_bucket())
        .await
        .context("failed to build S3 client")?;
    let store =
        BlobStore::new(Arc::new(client), config).context("invalid repository configuration")?;

    info!(location = %store.describe(), "verifying blob repository");
    let report = verify(&store).await?;
    info!(
        container = %report.container,
        blobs_written = report.blobs_written,
        bytes_written = report.bytes_written,
        blobs_deleted = report.deleted.blobs_deleted,
        bytes_deleted = report.deleted.bytes_deleted,
        "repository verified"
    );
    Ok(())
}
