use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, warn};

use super::object_store::ObjectStore;
use super::CloudError;

/// SigV4 presigned URLs cannot outlive one week
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// S3 bucket implementation of [`ObjectStore`]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(bucket: &str, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
            bucket: bucket.to_string(),
        }
    }
}

fn s3_error<E>(action: &str, key: &str, err: E) -> CloudError
where
    E: std::error::Error,
{
    CloudError::Storage(format!("{} {}: {}", action, key, DisplayErrorContext(err)))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), CloudError> {
        debug!("Writing s3://{}/{} ({} bytes)", self.bucket, key, body.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_error("put", key, e))?;
        Ok(())
    }

    // TODO: switch to a multipart upload once dumps can exceed the 5 GiB single-PUT limit
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), CloudError> {
        let body = ByteStream::from_path(path).await.map_err(|e| CloudError::Io {
            path: path.display().to_string(),
            source: std::io::Error::other(e),
        })?;
        debug!("Uploading {} to s3://{}/{}", path.display(), self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| s3_error("upload", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, CloudError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(s3_error("get", key, err));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| CloudError::Storage(format!("read body of {}: {}", key, e)))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>, CloudError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(
                output
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
            )),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(None)
                } else {
                    Err(s3_error("head", key, err))
                }
            }
        }
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, CloudError> {
        let expires_in = if expires_in > MAX_PRESIGN_EXPIRY {
            warn!(
                "Requested URL lifetime of {}s for {} exceeds the presign limit, using {}s",
                expires_in.as_secs(),
                key,
                MAX_PRESIGN_EXPIRY.as_secs()
            );
            MAX_PRESIGN_EXPIRY
        } else {
            expires_in
        };

        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| CloudError::Storage(format!("invalid URL lifetime: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| s3_error("presign", key, e))?;

        Ok(request.uri().to_string())
    }
}
