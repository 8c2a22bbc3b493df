pub mod database;
pub mod object_store;
pub mod rds;
pub mod s3;

pub use database::{
    DatabaseService, Endpoint, GroupStatus, InstanceInfo, ModifyRequest, RestoreRequest,
    SnapshotInfo,
};
pub use object_store::ObjectStore;

use thiserror::Error;

/// Errors raised by the external database service or object store
#[derive(Debug, Error)]
pub enum CloudError {
    /// The database service rejected or failed a request
    #[error("database service error: {0}")]
    Database(String),

    /// The object store rejected or failed a request
    #[error("object store error: {0}")]
    Storage(String),

    /// A local file could not be read for upload
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
