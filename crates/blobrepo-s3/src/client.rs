//! [`ObjectClient`] over the AWS SDK.

use std::io;

use async_trait::async_trait;
use aws_sdk_s3::{
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, Delete, ObjectIdentifier},
};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use blobrepo_core::{
    BodyStream, ByteRange, ClientError, CompletedPart, ConfigError, DeleteFailure, ListPage,
    ListRequest, ObjectBody, ObjectClient, ObjectSummary,
};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::settings::ClientSettings;

/// Map an SDK failure onto [`ClientError`].
///
/// Service answers keep their raw HTTP status, so a missing object is a 404
/// whatever the modeled error variant.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service) = &err {
        let inner = service.err();
        return ClientError::service(
            service.raw().status().as_u16(),
            inner.code().unwrap_or("Unknown"),
            inner.message().unwrap_or_default(),
        );
    }
    ClientError::transport(err)
}

fn part_number(number: u32) -> Result<i32, ClientError> {
    i32::try_from(number)
        .map_err(|_| ClientError::transport(format!("part number {number} out of range")))
}

/// An S3 object client scoped to one bucket.
#[derive(Debug, Clone)]
pub struct S3ObjectClient {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
}

impl S3ObjectClient {
    /// Wrap an SDK client for `bucket`.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        let region = client
            .config()
            .region()
            .map(ToString::to_string)
            .unwrap_or_default();
        Self {
            client,
            bucket: bucket.into(),
            region,
        }
    }

    /// Build a client for `bucket` from `settings`.
    pub async fn from_settings(
        settings: &ClientSettings,
        bucket: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let client = settings.build_sdk_client().await?;
        Ok(Self::new(client, bucket))
    }

    /// The underlying SDK client.
    #[must_use]
    pub fn sdk(&self) -> &aws_sdk_s3::Client {
        &self.client
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.region, self.bucket)
    }

    async fn object_exists(&self, key: &str) -> Result<bool, ClientError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = map_sdk_error(err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody, ClientError> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range.filter(|r| !r.is_full()) {
            req = req.range(range.header_value());
        }
        let resp = req.send().await.map_err(map_sdk_error)?;
        let content_length = resp
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or_default();
        trace!(key, content_length, "opened object stream");
        Ok(ObjectBody {
            stream: Box::new(S3Body {
                body: Some(resp.body),
            }),
            content_length,
        })
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<String, ClientError> {
        let size = body.len();
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(i64::try_from(size).unwrap_or(i64::MAX))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;
        debug!(key, size, "put object");
        Ok(resp.e_tag().unwrap_or_default().to_owned())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, ClientError> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        resp.upload_id()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ClientError::transport("no upload id in create_multipart_upload response"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        _is_last: bool,
    ) -> Result<CompletedPart, ClientError> {
        let size = body.len() as u64;
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(self::part_number(part_number)?)
            .content_length(i64::try_from(size).unwrap_or(i64::MAX))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(CompletedPart {
            part_number,
            size,
            etag: resp.e_tag().unwrap_or_default().to_owned(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError> {
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            completed.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part_number(part.part_number)?)
                    .build(),
            );
        }
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ClientError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn delete_objects(
        &self,
        keys: &[String],
        quiet: bool,
    ) -> Result<Vec<DeleteFailure>, ClientError> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ClientError::transport)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(quiet)
            .build()
            .map_err(ClientError::transport)?;

        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(resp
            .errors()
            .iter()
            .map(|e| {
                DeleteFailure::new(
                    e.key().unwrap_or_default(),
                    e.code().unwrap_or("Unknown"),
                    e.message().unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, ClientError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation.clone())
            .send()
            .await
            .map_err(map_sdk_error)?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(|o| {
                o.key().map(|key| ObjectSummary {
                    key: key.to_owned(),
                    size: o.size().and_then(|s| u64::try_from(s).ok()).unwrap_or_default(),
                })
            })
            .collect();
        let common_prefixes = resp
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(ToOwned::to_owned))
            .collect();
        let next_continuation = if resp.is_truncated() == Some(true) {
            resp.next_continuation_token().map(ToOwned::to_owned)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_continuation,
        })
    }
}

/// A GetObject body.
struct S3Body {
    body: Option<ByteStream>,
}

#[async_trait]
impl BodyStream for S3Body {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.body.as_mut() {
            Some(body) => body.try_next().await.map_err(io::Error::other),
            None => Ok(None),
        }
    }

    fn abort(&mut self) {
        // Dropping the stream closes the connection without draining it.
        self.body = None;
    }
}
