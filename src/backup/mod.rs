pub mod error;
pub mod export;
pub mod invocation;
pub mod job;
pub mod naming;
pub mod notify;
pub mod poll;
pub mod record;
pub mod status;

pub use error::BackupError;
pub use invocation::{BackupInvocation, BackupParameters};
pub use job::{perform, BackupJob, BackupServices, JobSettings, Phase, ResumePoint};
pub use record::JobRecord;
pub use status::{BackupFile, StatusDocument};
