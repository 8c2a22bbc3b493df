use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use thiserror::Error;

use crate::backup::BackupInvocation;
use crate::db::job_repository::JobRepository;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize job parameters: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hands a backup invocation to whatever delivers it to a worker
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns the queue's id for the new entry
    async fn enqueue(&self, invocation: &BackupInvocation) -> Result<i64, QueueError>;
}

/// Postgres-backed queue read by [`crate::worker::JobWorker`]
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
}

impl PgJobQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, invocation: &BackupInvocation) -> Result<i64, QueueError> {
        JobRepository::enqueue(&self.pool, invocation).await
    }
}
