use std::sync::Arc;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::accounts::AccountRegistry;
use crate::api::validation::ErrorResponse;
use crate::backup::{BackupError, BackupInvocation, BackupParameters, JobRecord, StatusDocument};
use crate::cloud::{CloudError, ObjectStore};
use crate::queue::{JobQueue, QueueError};

use super::models::BackupRequest;

/// Service-level errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("RDS instance {0} not found")]
    NotFound(String),

    #[error("instance lookup failed: {0}")]
    Lookup(#[from] CloudError),

    #[error("could not create job: {0}")]
    Job(#[from] BackupError),

    #[error("could not queue job: {0}")]
    Queue(#[from] QueueError),
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ServiceError::Validation(_) | ServiceError::NotFound(_) => {
                warn!("Rejected backup request: {}", self);
                self.to_string()
            }
            _ => {
                error!("Backup request failed: {}", self);
                "Failed to queue backup".to_string()
            }
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse::new(message))
    }
}

/// Creates backup jobs: resolves the account, publishes "queued", enqueues
pub struct BackupService {
    accounts: AccountRegistry,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    backup_prefix: String,
    status_url_ttl: Duration,
}

impl BackupService {
    pub fn new(
        accounts: AccountRegistry,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        backup_prefix: &str,
        status_url_ttl: Duration,
    ) -> Self {
        Self {
            accounts,
            store,
            queue,
            backup_prefix: backup_prefix.to_string(),
            status_url_ttl,
        }
    }

    /// Create a backup job for `request.rds_instance`.
    ///
    /// The returned document is the job's first published status, so it
    /// already carries the `status_url` clients poll.
    pub async fn request_backup(&self, request: &BackupRequest) -> Result<StatusDocument, ServiceError> {
        let rds_instance = request
            .rds_instance
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServiceError::Validation("Parameter 'rds_instance' required".into()))?;

        let account_name = self
            .accounts
            .find_account(rds_instance)
            .await?
            .ok_or_else(|| ServiceError::NotFound(rds_instance.to_string()))?;

        let parameters = BackupParameters::new(&account_name, request.job_options());
        let mut record = JobRecord::new(
            rds_instance,
            &parameters,
            self.store.clone(),
            &self.backup_prefix,
            self.status_url_ttl,
        )?;
        let document = record.publish().await?;

        let invocation = BackupInvocation {
            rds_instance: rds_instance.to_string(),
            parameters: record.parameters(),
        };
        let queue_id = self.queue.enqueue(&invocation).await?;

        info!(
            backup_id = %record.backup_id(),
            rds_instance = %rds_instance,
            account_name = %account_name,
            "Queued backup as job {}",
            queue_id
        );
        Ok(document)
    }
}
