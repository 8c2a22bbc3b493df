use sqlx::{Pool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::db::job_repository::JobRepository;
use crate::db::models::BackupJobRow;

use super::context::WorkerContext;

const IDLE_DELAY: Duration = Duration::from_secs(5);
const ERROR_DELAY: Duration = Duration::from_secs(1);

/// Background worker running queued backups
pub struct JobWorker {
    pool: Pool<Postgres>,
    context: Arc<WorkerContext>,
    max_attempts: i32,
}

impl JobWorker {
    pub fn new(pool: Pool<Postgres>, context: Arc<WorkerContext>, max_attempts: i32) -> Self {
        Self {
            pool,
            context,
            max_attempts,
        }
    }

    /// Run worker with semaphore-based bounded concurrency
    ///
    /// # Concurrency Model
    /// - A semaphore permit is taken before a job is acquired, so a worker
    ///   never holds a queue row it has no capacity to run
    /// - Each job runs in its own task inside the transaction that locked its
    ///   row; the row is deleted on success or its failure recorded
    /// - On shutdown the worker stops acquiring and waits for running jobs
    pub async fn run(
        &self,
        worker_id: u32,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Worker {} started with semaphore-based concurrency", worker_id);
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Worker {} failed to acquire semaphore: {:?}", worker_id, e);
                        break;
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            let mut tx = match self.pool.begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    error!("Worker {} could not start transaction: {:?}", worker_id, e);
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown_rx, ERROR_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            match JobRepository::acquire_next_job(&mut tx).await {
                Ok(Some(job)) => {
                    info!(
                        "Worker {} acquired job: id={}, rds_instance={}, attempts={}",
                        worker_id, job.id, job.rds_instance, job.attempts
                    );
                    let context = self.context.clone();
                    let max_attempts = self.max_attempts;
                    in_flight.spawn(async move {
                        process_job(&context, tx, job, max_attempts).await;
                        // Permit is released once the job's transaction has ended
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if let Err(e) = tx.rollback().await {
                        warn!("Worker {} failed to release idle transaction: {:?}", worker_id, e);
                    }
                    if wait_or_shutdown(&mut shutdown_rx, IDLE_DELAY).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Worker {} encountered database error: {:?}", worker_id, e);
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown_rx, ERROR_DELAY).await {
                        break;
                    }
                }
            }

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!("Worker {} job task panicked: {:?}", worker_id, e);
                }
            }
        }

        info!(
            "Worker {} stopping, waiting for {} running jobs",
            worker_id,
            in_flight.len()
        );
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!("Worker {} job task panicked: {:?}", worker_id, e);
            }
        }
        info!("Worker {} stopped", worker_id);
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns true on shutdown.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let changed = tokio::select! {
        _ = sleep(delay) => return false,
        changed = shutdown_rx.changed() => changed,
    };
    changed.is_err() || *shutdown_rx.borrow()
}

async fn process_job(
    context: &WorkerContext,
    mut tx: Transaction<'static, Postgres>,
    job: BackupJobRow,
    max_attempts: i32,
) {
    let outcome = match job.invocation() {
        Ok(invocation) => context
            .perform(&invocation)
            .await
            .map(|document| document.status_message)
            .map_err(|e| e.summary()),
        Err(e) => Err(format!("malformed job parameters: {}", e)),
    };

    let recorded = match &outcome {
        Ok(message) => {
            info!("Completed job {}: {}", job.id, message);
            JobRepository::delete_job(&mut tx, job.id).await
        }
        Err(message) => {
            warn!("Job {} failed: {}", job.id, message);
            JobRepository::record_failure(&mut tx, job.id, message, max_attempts)
                .await
                .map(|dead| {
                    if dead {
                        error!("Job {} dead-lettered after {} attempts", job.id, max_attempts);
                    }
                })
        }
    };

    match recorded {
        Ok(()) => {
            if let Err(e) = tx.commit().await {
                error!("Failed to commit outcome of job {}: {:?}", job.id, e);
            }
        }
        Err(e) => error!("Failed to record outcome of job {}: {:?}", job.id, e),
    }
}
