use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::CloudError;

/// Bucket-scoped object storage used for status documents and dump artifacts
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), CloudError>;

    /// Streams a local file to `key`
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), CloudError>;

    /// Returns `Ok(None)` when the object does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, CloudError>;

    /// Size in bytes of a stored object, `Ok(None)` when it does not exist
    async fn object_size(&self, key: &str) -> Result<Option<u64>, CloudError>;

    /// A time-limited URL granting read access to `key`
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, CloudError>;
}
