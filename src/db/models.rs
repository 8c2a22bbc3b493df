use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Database representation of a queued backup invocation
#[derive(Debug, FromRow)]
pub struct BackupJobRow {
    pub id: i64,
    pub rds_instance: String,
    pub parameters: Value,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
