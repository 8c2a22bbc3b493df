use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cloud::ObjectStore;

use super::error::BackupError;
use super::invocation::{format_requested, BackupParameters};
use super::naming::JobPaths;
use super::status::{BackupFile, StatusDocument, StatusPublisher, STATUS_OK};

/// Identity and client-visible state of one backup job.
///
/// Built from serialized parameters on both the enqueue side and the worker;
/// never shared between them in memory.
pub struct JobRecord {
    rds_instance: String,
    account_name: String,
    backup_id: String,
    requested: DateTime<Utc>,
    options: BTreeMap<String, String>,
    status: u16,
    message: String,
    files: Vec<BackupFile>,
    terminal: bool,
    paths: JobPaths,
    publisher: StatusPublisher,
}

impl JobRecord {
    pub fn new(
        rds_instance: &str,
        parameters: &BackupParameters,
        store: Arc<dyn ObjectStore>,
        backup_prefix: &str,
        status_url_ttl: Duration,
    ) -> Result<Self, BackupError> {
        parameters.validate()?;
        let requested = parameters.requested_at()?;
        let paths = JobPaths::new(backup_prefix, requested, rds_instance, &parameters.backup_id);
        let publisher = StatusPublisher::new(store, paths.status_key(), status_url_ttl)
            .with_status_url(parameters.status_url.clone());

        Ok(Self {
            rds_instance: rds_instance.to_string(),
            account_name: parameters.account_name.clone(),
            backup_id: parameters.backup_id.clone(),
            requested,
            options: parameters.options.clone(),
            status: STATUS_OK,
            message: "queued".to_string(),
            files: Vec::new(),
            terminal: false,
            paths,
            publisher,
        })
    }

    pub fn rds_instance(&self) -> &str {
        &self.rds_instance
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn requested(&self) -> DateTime<Utc> {
        self.requested
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn set_files(&mut self, files: Vec<BackupFile>) {
        self.files = files;
    }

    /// Parameters that rehydrate this job elsewhere, including its status URL
    pub fn parameters(&self) -> BackupParameters {
        BackupParameters {
            backup_id: self.backup_id.clone(),
            requested: format_requested(self.requested),
            account_name: self.account_name.clone(),
            status_url: self.publisher.status_url().map(str::to_string),
            options: self.options.clone(),
        }
    }

    pub fn document(&self) -> StatusDocument {
        StatusDocument {
            rds_instance: self.rds_instance.clone(),
            account_name: self.account_name.clone(),
            backup_status: self.status,
            status_message: self.message.clone(),
            status_url: self.publisher.status_url().map(str::to_string),
            files: self.files.clone(),
        }
    }

    /// Look for a status URL assigned by an earlier publish of this job
    pub async fn recover_status_url(&mut self) -> Result<(), BackupError> {
        self.publisher.recover_status_url().await?;
        Ok(())
    }

    /// Write the current state without changing it
    pub async fn publish(&mut self) -> Result<StatusDocument, BackupError> {
        if self.terminal {
            return Err(BackupError::AlreadyTerminal(self.backup_id.clone()));
        }
        let document = self.document();
        self.publisher.publish(document).await
    }

    /// Record a progress message and publish it
    pub async fn update_status(&mut self, message: impl Into<String>) -> Result<StatusDocument, BackupError> {
        if self.terminal {
            return Err(BackupError::AlreadyTerminal(self.backup_id.clone()));
        }
        self.message = message.into();
        info!(
            backup_id = %self.backup_id,
            rds_instance = %self.rds_instance,
            "{}",
            self.message
        );
        self.publish().await
    }

    /// Publish the terminal status. Allowed once; later publishes are rejected.
    pub async fn finish(&mut self, status: u16, message: impl Into<String>) -> Result<StatusDocument, BackupError> {
        if self.terminal {
            return Err(BackupError::AlreadyTerminal(self.backup_id.clone()));
        }
        self.status = status;
        self.message = message.into();
        let document = self.publisher.publish(self.document()).await?;
        self.terminal = true;
        info!(
            backup_id = %self.backup_id,
            rds_instance = %self.rds_instance,
            status = status,
            "{}",
            self.message
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::status::STATUS_FAILED;
    use crate::fakes::MemoryObjectStore;

    fn params() -> BackupParameters {
        BackupParameters {
            backup_id: "0123456789abcdef".into(),
            requested: "2024-05-06T07:08:09Z".into(),
            account_name: "prod".into(),
            status_url: None,
            options: BTreeMap::new(),
        }
    }

    fn record(store: Arc<MemoryObjectStore>) -> JobRecord {
        JobRecord::new("orders-db", &params(), store, "backups", Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn starts_queued_under_namespaced_key() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut record = record(store.clone());

        let doc = record.publish().await.unwrap();
        assert_eq!(doc.status_message, "queued");
        assert_eq!(doc.backup_status, STATUS_OK);
        assert!(store
            .object("backups/2024/05/06/orders-db/0123456789abcdef/status.json")
            .is_some());
    }

    #[tokio::test]
    async fn parameters_carry_status_url() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut record = record(store.clone());
        let doc = record.publish().await.unwrap();

        let params = record.parameters();
        assert_eq!(params.status_url, doc.status_url);
        assert_eq!(params.requested, "2024-05-06T07:08:09Z");

        let mut rehydrated =
            JobRecord::new("orders-db", &params, store.clone(), "backups", Duration::from_secs(60))
                .unwrap();
        let again = rehydrated.update_status("working").await.unwrap();
        assert_eq!(again.status_url, doc.status_url);
        assert_eq!(store.signed_url_count(), 1);
    }

    #[tokio::test]
    async fn terminal_status_is_published_once() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let mut record = record(store.clone());

        record.finish(STATUS_FAILED, "boom").await.unwrap();
        assert!(record.is_terminal());
        assert!(matches!(
            record.update_status("more").await,
            Err(BackupError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            record.finish(STATUS_OK, "done").await,
            Err(BackupError::AlreadyTerminal(_))
        ));
        assert_eq!(record.document().status_message, "boom");
    }
}
