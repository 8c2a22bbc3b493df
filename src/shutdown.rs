use actix_web::dev::ServerHandle;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Running HTTP server, absent in worker-only mode
pub struct HttpServerTask {
    pub handle: ServerHandle,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

/// Handles graceful shutdown of the application
///
/// This module orchestrates graceful shutdown by:
/// 1. Listening for shutdown signals (SIGTERM, SIGINT/CTRL+C)
/// 2. Stopping the HTTP server, if one is running
/// 3. Signaling workers to stop acquiring new backups
/// 4. Waiting for workers to finish the backups they are running
/// 5. Closing the queue database pool
pub struct ShutdownCoordinator {
    server: Option<HttpServerTask>,
    worker_handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    pool: Pool<Postgres>,
}

impl ShutdownCoordinator {
    pub fn new(
        server: Option<HttpServerTask>,
        worker_handles: Vec<JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
        pool: Pool<Postgres>,
    ) -> Self {
        Self {
            server,
            worker_handles,
            shutdown_tx,
            pool,
        }
    }

    /// Block until CTRL+C or SIGTERM (Unix only), then shut down
    pub async fn wait_for_shutdown(self) -> Result<(), std::io::Error> {
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received CTRL+C signal, initiating graceful shutdown...");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM signal, initiating graceful shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received CTRL+C signal, initiating graceful shutdown...");
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<(), std::io::Error> {
        if let Some(server) = &self.server {
            info!("Stopping HTTP server (no longer accepting new requests)...");
            server.handle.stop(true).await;
        }

        // Running backups are not interrupted; workers finish them first
        info!("Signaling workers to stop acquiring new backups...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal to workers: {:?}", e);
        }

        let num_workers = self.worker_handles.len();
        info!("Waiting for {} workers to complete running backups...", num_workers);
        for (i, handle) in self.worker_handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Worker {} failed to stop: {:?}", i + 1, e);
            }
        }
        info!("All workers stopped");

        if let Some(server) = self.server {
            match server.task.await {
                Ok(Ok(_)) => info!("HTTP server shut down successfully"),
                Ok(Err(e)) => error!("HTTP server encountered error during shutdown: {:?}", e),
                Err(e) => error!("HTTP server task panicked: {:?}", e),
            }
        }

        info!("Closing queue database pool...");
        self.pool.close().await;

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
