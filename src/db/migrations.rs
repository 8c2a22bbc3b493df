use sqlx::{Pool, Postgres};
use tracing::info;

/// Run all pending queue migrations
///
/// Safe to run multiple times; sqlx tracks which migrations have already
/// been applied.
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations...");

    // embedded at compile time from the migrations/ directory
    sqlx::migrate!("./migrations")
        .run(pool)
        .await?;

    info!("Database migrations completed successfully");
    Ok(())
}
