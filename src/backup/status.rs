use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cloud::ObjectStore;

use super::error::BackupError;

/// HTTP-style code reported while a job is queued, running or finished successfully
pub const STATUS_OK: u16 = 200;
/// HTTP-style code reported when a job failed
pub const STATUS_FAILED: u16 = 500;

/// One uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    pub size: u64,
    pub url: String,
}

/// The client-visible record of a backup job, stored as `status.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub rds_instance: String,
    pub account_name: String,
    pub backup_status: u16,
    pub status_message: String,
    pub status_url: Option<String>,
    pub files: Vec<BackupFile>,
}

impl StatusDocument {
    /// Pretty-printed JSON with a trailing newline
    pub fn render(&self) -> Result<String, serde_json::Error> {
        let mut body = serde_json::to_string_pretty(self)?;
        body.push('\n');
        Ok(body)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Writes status documents to a fixed key and owns the job's public status URL.
///
/// The URL can only be signed once the object exists, so the first publish
/// writes twice: once to create the object, once more with the URL embedded.
/// After that every publish is a single write and the URL never changes.
pub struct StatusPublisher {
    store: Arc<dyn ObjectStore>,
    key: String,
    url_ttl: Duration,
    status_url: Option<String>,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, key: String, url_ttl: Duration) -> Self {
        Self {
            store,
            key,
            url_ttl,
            status_url: None,
        }
    }

    /// Start from a URL assigned by an earlier publisher for the same job
    pub fn with_status_url(mut self, status_url: Option<String>) -> Self {
        self.status_url = status_url;
        self
    }

    pub fn status_url(&self) -> Option<&str> {
        self.status_url.as_deref()
    }

    /// Adopt the URL from a status document already stored for this job, if any
    pub async fn recover_status_url(&mut self) -> Result<Option<&str>, BackupError> {
        if self.status_url.is_none() {
            if let Some(bytes) = self.store.get_object(&self.key).await? {
                match StatusDocument::parse(&bytes) {
                    Ok(existing) => self.status_url = existing.status_url,
                    Err(e) => debug!("Ignoring unreadable status document {}: {}", self.key, e),
                }
            }
        }
        Ok(self.status_url())
    }

    /// Persist `document`, filling in its `status_url`. Returns the document as written.
    pub async fn publish(&mut self, mut document: StatusDocument) -> Result<StatusDocument, BackupError> {
        document.status_url = self.status_url.clone();
        self.write(&document).await?;

        if self.status_url.is_none() {
            let url = self.store.signed_url(&self.key, self.url_ttl).await?;
            debug!("Assigned status URL for {}", self.key);
            self.status_url = Some(url);
            document.status_url = self.status_url.clone();
            self.write(&document).await?;
        }

        Ok(document)
    }

    async fn write(&self, document: &StatusDocument) -> Result<(), BackupError> {
        let body = document.render()?;
        self.store
            .put_object(&self.key, body.into_bytes(), "application/json")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryObjectStore;
    use pretty_assertions::assert_eq;

    fn document(message: &str) -> StatusDocument {
        StatusDocument {
            rds_instance: "orders-db".into(),
            account_name: "prod".into(),
            backup_status: STATUS_OK,
            status_message: message.into(),
            status_url: None,
            files: vec![],
        }
    }

    #[test]
    fn renders_fields_in_document_order() {
        let body = document("queued").render().unwrap();
        assert!(body.ends_with("}\n"));
        let order: Vec<usize> = [
            "\"rds_instance\"",
            "\"account_name\"",
            "\"backup_status\"",
            "\"status_message\"",
            "\"status_url\"",
            "\"files\"",
        ]
        .iter()
        .map(|field| body.find(field).unwrap())
        .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert!(body.contains("\"status_url\": null"));
    }

    #[tokio::test]
    async fn first_publish_writes_twice_and_embeds_url() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut publisher =
            StatusPublisher::new(store.clone(), "p/status.json".into(), Duration::from_secs(60));

        let written = publisher.publish(document("queued")).await.unwrap();
        let url = written.status_url.clone().unwrap();
        assert_eq!(store.put_count("p/status.json"), 2);

        let stored = StatusDocument::parse(&store.object("p/status.json").unwrap()).unwrap();
        assert_eq!(stored.status_url.as_deref(), Some(url.as_str()));
        assert_eq!(stored, written);
    }

    #[tokio::test]
    async fn later_publishes_write_once_and_keep_url() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut publisher =
            StatusPublisher::new(store.clone(), "p/status.json".into(), Duration::from_secs(60));

        let first = publisher.publish(document("queued")).await.unwrap();
        let second = publisher.publish(document("working")).await.unwrap();
        let third = publisher.publish(document("done")).await.unwrap();

        assert_eq!(store.put_count("p/status.json"), 4);
        assert_eq!(store.signed_url_count(), 1);
        assert_eq!(first.status_url, second.status_url);
        assert_eq!(second.status_url, third.status_url);
    }

    #[tokio::test]
    async fn recovers_url_from_stored_document() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut enqueuer =
            StatusPublisher::new(store.clone(), "p/status.json".into(), Duration::from_secs(60));
        let original = enqueuer.publish(document("queued")).await.unwrap().status_url;

        let mut worker =
            StatusPublisher::new(store.clone(), "p/status.json".into(), Duration::from_secs(60));
        worker.recover_status_url().await.unwrap();
        let republished = worker.publish(document("working")).await.unwrap();

        assert_eq!(republished.status_url, original);
        assert_eq!(store.signed_url_count(), 1);
    }
}
