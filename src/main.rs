use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::{Parser, Subcommand};
use sqlx::{Pool, Postgres};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use rds_backup_service::accounts::AccountRegistry;
use rds_backup_service::api::{
    backup::{backup_config, BackupService},
    health::health_config,
    validation,
};
use rds_backup_service::backup::export::DumpToolExporter;
use rds_backup_service::backup::notify::{LogNotifier, NOTIFY_OPTION};
use rds_backup_service::backup::{BackupInvocation, BackupParameters};
use rds_backup_service::cloud::rds::RdsDatabaseService;
use rds_backup_service::cloud::s3::S3ObjectStore;
use rds_backup_service::cloud::ObjectStore;
use rds_backup_service::config::Config;
use rds_backup_service::db;
use rds_backup_service::logging;
use rds_backup_service::queue::PgJobQueue;
use rds_backup_service::shutdown::{HttpServerTask, ShutdownCoordinator};
use rds_backup_service::worker::{JobWorker, WorkerContext};

#[derive(Parser)]
#[command(name = "rds-backup-service", about = "Snapshot, clone, export and upload RDS backups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and background workers (default)
    Serve,
    /// Run background workers only
    Worker,
    /// Back up one instance inline and exit
    Perform {
        rds_instance: String,
        /// Account owning the instance; looked up when omitted
        #[arg(long)]
        account: Option<String>,
        /// Reuse an earlier job's id to resume it
        #[arg(long)]
        backup_id: Option<String>,
        /// Request time (RFC 3339) of the job being resumed
        #[arg(long, requires = "backup_id")]
        requested: Option<String>,
        /// Notify this address when the backup finishes
        #[arg(long)]
        email: Option<String>,
    },
    /// Apply queue database migrations and exit
    Migrate,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = Config::from_env()?;
    logging::init(&config.log_dir)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_service(config, true).await,
        Command::Worker => run_service(config, false).await,
        Command::Perform {
            rds_instance,
            account,
            backup_id,
            requested,
            email,
        } => perform_inline(config, rds_instance, account, backup_id, requested, email).await,
        Command::Migrate => {
            let pool = db::connection::get_connection(&config.database_url, config.max_db_connections).await?;
            db::migrations::run_migrations(&pool).await?;
            pool.close().await;
            Ok(())
        }
    }
}

async fn connect_accounts(config: &Config) -> AccountRegistry {
    let mut registry = AccountRegistry::new();
    for account in &config.accounts {
        let region = account.region.as_deref().or(config.aws_region.as_deref());
        // "default" uses the ambient credential chain, other names select a profile
        let profile = (account.name != "default").then_some(account.name.as_str());
        let database = RdsDatabaseService::connect(region, profile).await;
        info!("Registered account {} (region {:?})", account.name, region);
        registry = registry.with_account(&account.name, Arc::new(database));
    }
    registry
}

async fn worker_context(config: &Config, store: Arc<dyn ObjectStore>) -> WorkerContext {
    WorkerContext {
        accounts: connect_accounts(config).await,
        store,
        exporter: Arc::new(DumpToolExporter::new(config.dump_tool.clone())),
        notifier: Some(Arc::new(LogNotifier)),
        settings: Arc::new(config.job_settings()),
    }
}

fn spawn_workers(
    config: &Config,
    pool: &Pool<Postgres>,
    context: Arc<WorkerContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    // One semaphore across all workers bounds backups running in this process
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));

    (1..=config.num_workers)
        .map(|worker_id| {
            let job_worker = JobWorker::new(pool.clone(), context.clone(), config.max_job_attempts);
            let worker_semaphore = semaphore.clone();
            let worker_shutdown_rx = shutdown_rx.clone();
            info!("Spawned worker {}", worker_id);
            tokio::spawn(async move {
                job_worker
                    .run(worker_id, worker_semaphore, worker_shutdown_rx)
                    .await;
            })
        })
        .collect()
}

async fn run_service(config: Config, with_http: bool) -> Result<(), Box<dyn Error>> {
    info!("Starting rds-backup-service");
    info!("Configuration loaded successfully:");
    info!("  - Backup bucket: {}/{}", config.backup_bucket, config.backup_prefix);
    info!("  - Accounts: {}", config.accounts.len());
    info!("  - Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("  - Number of workers: {}", config.num_workers);
    info!(
        "  - Polling every {}s for up to {}s",
        config.poll_interval.as_secs(),
        config.poll_timeout.as_secs()
    );

    let pool = db::connection::get_connection(&config.database_url, config.max_db_connections).await?;
    info!("Database connection pool established");

    db::migrations::run_migrations(&pool).await?;

    let store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::connect(&config.backup_bucket, config.aws_region.as_deref()).await);
    let context = Arc::new(worker_context(&config, store.clone()).await);

    // watch channel allows multiple receivers to get the same value
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = spawn_workers(&config, &pool, context.clone(), shutdown_rx);

    let server = if with_http {
        let backup_service = web::Data::new(BackupService::new(
            context.accounts.clone(),
            store,
            Arc::new(PgJobQueue::new(pool.clone())),
            &config.backup_prefix,
            config.status_url_ttl,
        ));
        let server_pool = pool.clone();
        let api_root = config.api_root.clone();
        let max_payload_size = config.max_payload_size;

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(server_pool.clone()))
                .app_data(backup_service.clone())
                .app_data(web::PayloadConfig::default().limit(max_payload_size))
                .app_data(validation::json_config().limit(max_payload_size))
                .configure(health_config)
                .service(web::scope(&api_root).configure(backup_config))
        })
        .bind(config.bind_address.as_str())?
        .run();

        info!("Server starting on http://{}{}", config.bind_address, config.api_root);
        let handle = server.handle();
        Some(HttpServerTask {
            handle,
            task: tokio::spawn(server),
        })
    } else {
        info!("Running workers only");
        None
    };

    let coordinator = ShutdownCoordinator::new(server, worker_handles, shutdown_tx, pool);
    coordinator.wait_for_shutdown().await?;
    Ok(())
}

async fn perform_inline(
    config: Config,
    rds_instance: String,
    account: Option<String>,
    backup_id: Option<String>,
    requested: Option<String>,
    email: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::connect(&config.backup_bucket, config.aws_region.as_deref()).await);
    let context = worker_context(&config, store).await;

    let account_name = match account {
        Some(name) => name,
        None => context
            .accounts
            .find_account(&rds_instance)
            .await?
            .ok_or_else(|| format!("RDS instance {} not found", rds_instance))?,
    };

    let mut options = BTreeMap::new();
    if let Some(email) = email {
        options.insert(NOTIFY_OPTION.to_string(), email);
    }
    let mut parameters = BackupParameters::new(&account_name, options);
    if let Some(backup_id) = backup_id {
        parameters.backup_id = backup_id;
    }
    if let Some(requested) = requested {
        parameters.requested = requested;
    }

    let invocation = BackupInvocation {
        rds_instance,
        parameters,
    };
    match context.perform(&invocation).await {
        Ok(document) => {
            println!("{}", document.render()?.trim_end());
            Ok(())
        }
        Err(e) => {
            error!("Backup of {} failed: {}", invocation.rds_instance, e);
            Err(e.into())
        }
    }
}
