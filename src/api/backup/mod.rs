pub mod handlers;
pub mod models;
pub mod service;

// Re-export commonly used types
pub use handlers::backup_config;
pub use models::BackupRequest;
pub use service::{BackupService, ServiceError};
