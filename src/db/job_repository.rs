use serde::Serialize;
use sqlx::{FromRow, Pool, Postgres, Transaction};
use tracing::debug;

use crate::backup::{BackupInvocation, BackupParameters};
use crate::db::models::BackupJobRow;
use crate::queue::QueueError;

/// Repository for queued backup invocations
pub struct JobRepository;

#[derive(Debug, Clone, Copy, Serialize, FromRow)]
pub struct QueueStats {
    pub pending: i64,
    pub dead: i64,
}

impl JobRepository {
    pub async fn queue_stats(pool: &Pool<Postgres>) -> Result<QueueStats, sqlx::Error> {
        sqlx::query_as::<_, QueueStats>(
            r#"
            SELECT COUNT(*) FILTER (WHERE NOT dead) AS pending,
                   COUNT(*) FILTER (WHERE dead) AS dead
            FROM backup_jobs
            "#,
        )
        .fetch_one(pool)
        .await
    }

    /// Insert a new invocation and return its queue id
    pub async fn enqueue(
        pool: &Pool<Postgres>,
        invocation: &BackupInvocation,
    ) -> Result<i64, QueueError> {
        debug!(
            "Enqueuing backup: rds_instance={}, backup_id={}",
            invocation.rds_instance, invocation.parameters.backup_id
        );

        let parameters = serde_json::to_value(&invocation.parameters)?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO backup_jobs (rds_instance, parameters) VALUES ($1, $2) RETURNING id",
        )
        .bind(&invocation.rds_instance)
        .bind(parameters)
        .fetch_one(pool)
        .await?;

        debug!("Backup job queued with id={}", id);
        Ok(id)
    }

    /// Lock the oldest runnable job, if any.
    ///
    /// Failed jobs become runnable again after `1 minute * 2^attempts`. The row
    /// stays locked until `tx` ends, so no other worker picks it up meanwhile.
    pub async fn acquire_next_job(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<BackupJobRow>, sqlx::Error> {
        sqlx::query_as::<_, BackupJobRow>(
            r#"
            SELECT id, rds_instance, parameters, attempts, last_attempt, last_error, created_at
            FROM backup_jobs
            WHERE NOT dead
              AND (attempts = 0 OR last_attempt < NOW() - INTERVAL '1 minute' * POWER(2, attempts))
            ORDER BY id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut **tx)
        .await
    }

    /// Remove a job that ran to completion
    pub async fn delete_job(tx: &mut Transaction<'_, Postgres>, job_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        debug!("Deleted completed job {}", job_id);
        Ok(())
    }

    /// Count a failed attempt. Returns true when the job is now dead-lettered.
    pub async fn record_failure(
        tx: &mut Transaction<'_, Postgres>,
        job_id: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<bool, sqlx::Error> {
        let dead = sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE backup_jobs
            SET attempts = attempts + 1,
                last_attempt = NOW(),
                last_error = $2,
                dead = attempts + 1 >= $3
            WHERE id = $1
            RETURNING dead
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(max_attempts)
        .fetch_one(&mut **tx)
        .await?;
        debug!("Recorded failure for job {} (dead={})", job_id, dead);
        Ok(dead)
    }
}

impl BackupJobRow {
    /// Decode the stored invocation
    pub fn invocation(&self) -> Result<BackupInvocation, serde_json::Error> {
        let parameters: BackupParameters = serde_json::from_value(self.parameters.clone())?;
        Ok(BackupInvocation {
            rds_instance: self.rds_instance.clone(),
            parameters,
        })
    }
}
