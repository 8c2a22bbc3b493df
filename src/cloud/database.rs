use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::CloudError;

/// Status string the database service reports for a usable instance or snapshot
pub const AVAILABLE: &str = "available";

/// Network address of a database instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// Name and status of a group attached to an instance.
///
/// For parameter groups the status is the apply status (`in-sync`,
/// `pending-reboot`, `applying`); for network groups it is the membership
/// status (`adding`, `active`, `removing`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub name: String,
    pub status: String,
}

/// Point-in-time view of a managed database instance
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub status: String,
    pub instance_class: String,
    pub engine: String,
    pub db_name: Option<String>,
    pub master_username: String,
    pub endpoint: Option<Endpoint>,
    pub parameter_groups: Vec<GroupStatus>,
    pub security_groups: Vec<GroupStatus>,
}

impl InstanceInfo {
    pub fn is_ready(&self) -> bool {
        self.status == AVAILABLE
    }

    /// The parameter group the instance was launched with
    pub fn primary_parameter_group(&self) -> Option<&str> {
        self.parameter_groups.first().map(|g| g.name.as_str())
    }

    pub fn parameter_group_status(&self, name: &str) -> Option<&str> {
        find_status(&self.parameter_groups, name)
    }

    pub fn security_group_status(&self, name: &str) -> Option<&str> {
        find_status(&self.security_groups, name)
    }
}

fn find_status<'a>(groups: &'a [GroupStatus], name: &str) -> Option<&'a str> {
    groups
        .iter()
        .find(|g| g.name == name)
        .map(|g| g.status.as_str())
}

/// Point-in-time view of a database snapshot
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub id: String,
    pub instance_id: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl SnapshotInfo {
    pub fn is_ready(&self) -> bool {
        self.status == AVAILABLE
    }
}

/// Parameters for restoring a new instance from a snapshot
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub instance_id: String,
    pub snapshot_id: String,
    pub instance_class: String,
}

/// Settings applied to a freshly restored clone
#[derive(Clone)]
pub struct ModifyRequest {
    pub instance_id: String,
    pub parameter_group: String,
    pub security_group: String,
    pub master_password: String,
}

impl std::fmt::Debug for ModifyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModifyRequest")
            .field("instance_id", &self.instance_id)
            .field("parameter_group", &self.parameter_group)
            .field("security_group", &self.security_group)
            .field("master_password", &"<redacted>")
            .finish()
    }
}

/// Operations the backup pipeline needs from the managed database service.
///
/// `describe_*` return `Ok(None)` when the resource does not exist; every
/// other failure is an error. Mutating calls only request the change, the
/// caller polls for the outcome.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, CloudError>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>, CloudError>;

    async fn create_snapshot(&self, snapshot_id: &str, instance_id: &str) -> Result<(), CloudError>;

    async fn restore_from_snapshot(&self, request: &RestoreRequest) -> Result<(), CloudError>;

    async fn modify_instance(&self, request: &ModifyRequest) -> Result<(), CloudError>;

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;

    /// Destroys an instance without taking a final snapshot
    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError>;
}
