use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_rds::types::{DbInstance, DbSnapshot};
use aws_sdk_rds::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::database::{
    DatabaseService, Endpoint, GroupStatus, InstanceInfo, ModifyRequest, RestoreRequest,
    SnapshotInfo,
};
use super::CloudError;

/// Amazon RDS implementation of [`DatabaseService`]
pub struct RdsDatabaseService {
    client: Client,
}

impl RdsDatabaseService {
    /// Build a client from the default AWS credential chain.
    ///
    /// `profile` selects a named profile from the shared config files, which is
    /// how separate accounts are addressed.
    pub async fn connect(region: Option<&str>, profile: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
        }
    }
}

fn rds_error<E>(action: &str, id: &str, err: E) -> CloudError
where
    E: std::error::Error,
{
    CloudError::Database(format!("{} {}: {}", action, id, DisplayErrorContext(err)))
}

fn default_port(engine: &str) -> u16 {
    if engine.starts_with("postgres") || engine.starts_with("aurora-postgresql") {
        5432
    } else {
        3306
    }
}

fn instance_info(instance: &DbInstance) -> InstanceInfo {
    let engine = instance.engine().unwrap_or_default().to_string();
    let endpoint = instance.endpoint().and_then(|ep| {
        ep.address().map(|address| Endpoint {
            address: address.to_string(),
            port: ep
                .port()
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or_else(|| default_port(&engine)),
        })
    });

    InstanceInfo {
        id: instance.db_instance_identifier().unwrap_or_default().to_string(),
        status: instance.db_instance_status().unwrap_or("unknown").to_string(),
        instance_class: instance.db_instance_class().unwrap_or_default().to_string(),
        db_name: instance.db_name().map(str::to_string),
        master_username: instance.master_username().unwrap_or_default().to_string(),
        endpoint,
        parameter_groups: instance
            .db_parameter_groups()
            .iter()
            .map(|g| GroupStatus {
                name: g.db_parameter_group_name().unwrap_or_default().to_string(),
                status: g.parameter_apply_status().unwrap_or("unknown").to_string(),
            })
            .collect(),
        security_groups: instance
            .vpc_security_groups()
            .iter()
            .map(|g| GroupStatus {
                name: g.vpc_security_group_id().unwrap_or_default().to_string(),
                status: g.status().unwrap_or("unknown").to_string(),
            })
            .collect(),
        engine,
    }
}

fn snapshot_info(snapshot: &DbSnapshot) -> SnapshotInfo {
    SnapshotInfo {
        id: snapshot.db_snapshot_identifier().unwrap_or_default().to_string(),
        instance_id: snapshot.db_instance_identifier().unwrap_or_default().to_string(),
        status: snapshot.status().unwrap_or("unknown").to_string(),
        created_at: snapshot
            .snapshot_create_time()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
    }
}

#[async_trait]
impl DatabaseService for RdsDatabaseService {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, CloudError> {
        match self
            .client
            .describe_db_instances()
            .db_instance_identifier(instance_id)
            .send()
            .await
        {
            Ok(output) => Ok(output.db_instances().first().map(instance_info)),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_db_instance_not_found_fault())
                {
                    debug!("RDS instance {} does not exist", instance_id);
                    Ok(None)
                } else {
                    Err(rds_error("describe instance", instance_id, err))
                }
            }
        }
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>, CloudError> {
        match self
            .client
            .describe_db_snapshots()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
        {
            Ok(output) => Ok(output.db_snapshots().first().map(snapshot_info)),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_db_snapshot_not_found_fault())
                {
                    debug!("RDS snapshot {} does not exist", snapshot_id);
                    Ok(None)
                } else {
                    Err(rds_error("describe snapshot", snapshot_id, err))
                }
            }
        }
    }

    async fn create_snapshot(&self, snapshot_id: &str, instance_id: &str) -> Result<(), CloudError> {
        self.client
            .create_db_snapshot()
            .db_snapshot_identifier(snapshot_id)
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| rds_error("create snapshot", snapshot_id, e))?;
        Ok(())
    }

    async fn restore_from_snapshot(&self, request: &RestoreRequest) -> Result<(), CloudError> {
        self.client
            .restore_db_instance_from_db_snapshot()
            .db_instance_identifier(&request.instance_id)
            .db_snapshot_identifier(&request.snapshot_id)
            .db_instance_class(&request.instance_class)
            .send()
            .await
            .map_err(|e| rds_error("restore instance", &request.instance_id, e))?;
        Ok(())
    }

    async fn modify_instance(&self, request: &ModifyRequest) -> Result<(), CloudError> {
        self.client
            .modify_db_instance()
            .db_instance_identifier(&request.instance_id)
            .apply_immediately(true)
            .db_parameter_group_name(&request.parameter_group)
            .vpc_security_group_ids(&request.security_group)
            .master_user_password(&request.master_password)
            .send()
            .await
            .map_err(|e| rds_error("modify instance", &request.instance_id, e))?;
        Ok(())
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.client
            .reboot_db_instance()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| rds_error("reboot instance", instance_id, e))?;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        self.client
            .delete_db_snapshot()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
            .map_err(|e| rds_error("delete snapshot", snapshot_id, e))?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.client
            .delete_db_instance()
            .db_instance_identifier(instance_id)
            .skip_final_snapshot(true)
            .delete_automated_backups(true)
            .send()
            .await
            .map_err(|e| rds_error("delete instance", instance_id, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_rds::types::{DbParameterGroupStatus, VpcSecurityGroupMembership};

    #[test]
    fn maps_sdk_instance_to_instance_info() {
        let sdk = DbInstance::builder()
            .db_instance_identifier("orders")
            .db_instance_status("available")
            .db_instance_class("db.r5.large")
            .engine("postgres")
            .master_username("root")
            .endpoint(
                aws_sdk_rds::types::Endpoint::builder()
                    .address("orders.abc.rds.amazonaws.com")
                    .build(),
            )
            .db_parameter_groups(
                DbParameterGroupStatus::builder()
                    .db_parameter_group_name("orders-pg")
                    .parameter_apply_status("in-sync")
                    .build(),
            )
            .vpc_security_groups(
                VpcSecurityGroupMembership::builder()
                    .vpc_security_group_id("sg-123")
                    .status("active")
                    .build(),
            )
            .build();

        let info = instance_info(&sdk);
        assert!(info.is_ready());
        assert_eq!(info.db_name, None);
        assert_eq!(
            info.endpoint,
            Some(Endpoint {
                address: "orders.abc.rds.amazonaws.com".into(),
                port: 5432,
            })
        );
        assert_eq!(info.parameter_group_status("orders-pg"), Some("in-sync"));
        assert_eq!(info.security_group_status("sg-123"), Some("active"));
    }
}
