use std::sync::Arc;

use tracing::error;

use crate::accounts::AccountRegistry;
use crate::backup::export::Exporter;
use crate::backup::notify::Notifier;
use crate::backup::status::STATUS_FAILED;
use crate::backup::{
    perform, BackupError, BackupInvocation, BackupServices, JobRecord, JobSettings, StatusDocument,
};
use crate::cloud::ObjectStore;

/// Everything a worker needs to run any queued backup
#[derive(Clone)]
pub struct WorkerContext {
    pub accounts: AccountRegistry,
    pub store: Arc<dyn ObjectStore>,
    pub exporter: Arc<dyn Exporter>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub settings: Arc<JobSettings>,
}

impl WorkerContext {
    /// Capabilities bound to one account
    pub fn services_for(&self, account_name: &str) -> Option<BackupServices> {
        let database = self.accounts.database(account_name)?;
        Some(BackupServices {
            database,
            store: self.store.clone(),
            exporter: self.exporter.clone(),
            notifier: self.notifier.clone(),
        })
    }

    /// Run one invocation to its terminal status
    pub async fn perform(&self, invocation: &BackupInvocation) -> Result<StatusDocument, BackupError> {
        let parameters = &invocation.parameters;
        match self.services_for(&parameters.account_name) {
            Some(services) => {
                perform(
                    &invocation.rds_instance,
                    parameters,
                    services,
                    self.settings.clone(),
                )
                .await
            }
            None => {
                let err = BackupError::UnknownAccount(parameters.account_name.clone());
                self.publish_failure(invocation, &err).await;
                Err(err)
            }
        }
    }

    async fn publish_failure(&self, invocation: &BackupInvocation, err: &BackupError) {
        let record = JobRecord::new(
            &invocation.rds_instance,
            &invocation.parameters,
            self.store.clone(),
            &self.settings.backup_prefix,
            self.settings.status_url_ttl,
        );
        let result = match record {
            Ok(mut record) => {
                if let Err(e) = record.recover_status_url().await {
                    error!("Could not read existing status: {}", e);
                }
                record.finish(STATUS_FAILED, err.summary()).await.map(|_| ())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(
                rds_instance = %invocation.rds_instance,
                "Failed to publish failure status: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::poll::PollPolicy;
    use crate::backup::BackupParameters;
    use crate::fakes::{FakeDatabaseService, FakeExporter, MemoryObjectStore};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn context(store: Arc<MemoryObjectStore>) -> WorkerContext {
        let database = Arc::new(FakeDatabaseService::new(1));
        WorkerContext {
            accounts: AccountRegistry::new().with_account("prod", database),
            store,
            exporter: Arc::new(FakeExporter::new()),
            notifier: None,
            settings: Arc::new(JobSettings {
                backup_prefix: "backups".into(),
                scratch_dir: std::env::temp_dir(),
                security_group: "sg-backup".into(),
                credential_secret: "secret".into(),
                poll: PollPolicy::new(Duration::from_millis(1), Duration::from_secs(1)),
                max_reboots: 3,
                status_url_ttl: Duration::from_secs(60),
                artifact_url_ttl: Duration::from_secs(60),
            }),
        }
    }

    #[tokio::test]
    async fn unknown_account_publishes_failure() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let context = context(store.clone());
        let invocation = BackupInvocation {
            rds_instance: "orders-db".into(),
            parameters: BackupParameters {
                backup_id: "feedbeef".into(),
                requested: "2024-02-03T04:05:06Z".into(),
                account_name: "staging".into(),
                status_url: None,
                options: BTreeMap::new(),
            },
        };

        let err = context.perform(&invocation).await.unwrap_err();
        assert!(matches!(err, BackupError::UnknownAccount(_)));

        let body = store
            .object("backups/2024/02/03/orders-db/feedbeef/status.json")
            .unwrap();
        let doc = StatusDocument::parse(&body).unwrap();
        assert_eq!(doc.backup_status, STATUS_FAILED);
        assert_eq!(doc.status_message, "unknown account staging");
    }
}
