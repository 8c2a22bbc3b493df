//! The backup pipeline.
//!
//! snapshot -> clone -> harden -> export -> teardown -> upload, publishing the
//! status document after every transition. The job keeps no durable record of
//! how far it got: PREPARE probes the database service for the resources this
//! job's derived names point at, and the steps skip whatever already exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cloud::{DatabaseService, InstanceInfo, ModifyRequest, ObjectStore, RestoreRequest};

use super::error::BackupError;
use super::export::{Engine, ExportRequest, ExportedFile, Exporter};
use super::invocation::BackupParameters;
use super::naming::{dump_file_name, MasterCredential, ResourceNames};
use super::notify::{Notification, Notifier, NOTIFY_OPTION};
use super::poll::{poll_until, PollPolicy, Probe};
use super::record::JobRecord;
use super::status::{BackupFile, StatusDocument, STATUS_FAILED, STATUS_OK};

const SECURITY_GROUP_ACTIVE: &str = "active";
const PARAMETERS_IN_SYNC: &str = "in-sync";
const PARAMETERS_PENDING_REBOOT: &str = "pending-reboot";
const INSTANCE_DELETING: &str = "deleting";

/// Explicit per-job configuration; the pipeline never reads the environment
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub backup_prefix: String,
    pub scratch_dir: PathBuf,
    /// Restricted network group applied to every clone
    pub security_group: String,
    /// Mixed into the derived master credential
    pub credential_secret: String,
    pub poll: PollPolicy,
    pub max_reboots: u32,
    pub status_url_ttl: Duration,
    pub artifact_url_ttl: Duration,
}

/// External capabilities a job drives
#[derive(Clone)]
pub struct BackupServices {
    pub database: Arc<dyn DatabaseService>,
    pub store: Arc<dyn ObjectStore>,
    pub exporter: Arc<dyn Exporter>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// Progress marker, for logging only. The real position is whatever the
/// database service reports for the derived resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Preparing,
    Snapshotting,
    SnapshotReady,
    Cloning,
    CloneReady,
    Configuring,
    SecurityGroupApplied,
    ParameterGroupApplied,
    SnapshotDeleted,
    Exporting,
    CloneDeleted,
    Uploaded,
    Complete,
    Failed,
}

/// Where PREPARE found an earlier attempt of this job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing exists yet
    Fresh,
    /// The snapshot exists but no clone was restored from it
    SnapshotExists,
    /// The clone exists, so snapshotting already finished
    CloneExists,
}

impl ResumePoint {
    fn from_probes(snapshot_exists: bool, clone_exists: bool) -> Self {
        match (snapshot_exists, clone_exists) {
            (_, true) => ResumePoint::CloneExists,
            (true, false) => ResumePoint::SnapshotExists,
            (false, false) => ResumePoint::Fresh,
        }
    }
}

/// Outcome of one parameter-group check on the clone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterSync {
    InSync,
    PendingReboot,
}

async fn probe_instance_ready(
    database: &dyn DatabaseService,
    instance_id: &str,
) -> Result<Probe<InstanceInfo>, BackupError> {
    match database.describe_instance(instance_id).await? {
        Some(info) if info.is_ready() => Ok(Probe::Ready(info)),
        Some(info) => Ok(Probe::Pending(format!("{} is {}", instance_id, info.status))),
        None => Err(BackupError::InstanceNotFound(instance_id.to_string())),
    }
}

async fn probe_instance_gone(
    database: &dyn DatabaseService,
    instance_id: &str,
) -> Result<Probe<()>, BackupError> {
    match database.describe_instance(instance_id).await? {
        Some(info) => Ok(Probe::Pending(format!("{} is {}", instance_id, info.status))),
        None => Ok(Probe::Ready(())),
    }
}

async fn probe_snapshot_ready(
    database: &dyn DatabaseService,
    snapshot_id: &str,
) -> Result<Probe<()>, BackupError> {
    match database.describe_snapshot(snapshot_id).await? {
        Some(snapshot) if snapshot.is_ready() => Ok(Probe::Ready(())),
        Some(snapshot) => Ok(Probe::Pending(format!("{} is {}", snapshot_id, snapshot.status))),
        None => Err(BackupError::Cloud(crate::cloud::CloudError::Database(format!(
            "snapshot {} disappeared",
            snapshot_id
        )))),
    }
}

async fn probe_security_group(
    database: &dyn DatabaseService,
    instance_id: &str,
    group: &str,
) -> Result<Probe<()>, BackupError> {
    let info = database
        .describe_instance(instance_id)
        .await?
        .ok_or_else(|| BackupError::InstanceNotFound(instance_id.to_string()))?;
    match info.security_group_status(group).unwrap_or("Unknown") {
        SECURITY_GROUP_ACTIVE => Ok(Probe::Ready(())),
        other => Ok(Probe::Pending(format!("security group {} is {}", group, other))),
    }
}

async fn probe_parameter_group(
    database: &dyn DatabaseService,
    instance_id: &str,
    group: &str,
) -> Result<Probe<ParameterSync>, BackupError> {
    let info = database
        .describe_instance(instance_id)
        .await?
        .ok_or_else(|| BackupError::InstanceNotFound(instance_id.to_string()))?;
    match info.parameter_group_status(group).unwrap_or("Unknown") {
        PARAMETERS_PENDING_REBOOT => Ok(Probe::Ready(ParameterSync::PendingReboot)),
        PARAMETERS_IN_SYNC if info.is_ready() => Ok(Probe::Ready(ParameterSync::InSync)),
        other => Ok(Probe::Pending(format!(
            "parameter group {} is {} on {} ({})",
            group, other, instance_id, info.status
        ))),
    }
}

/// One backup job being executed by a worker
pub struct BackupJob {
    record: JobRecord,
    names: ResourceNames,
    credential: MasterCredential,
    services: BackupServices,
    settings: Arc<JobSettings>,
    phase: Phase,
}

impl BackupJob {
    /// Rehydrate a job from its serialized invocation
    pub fn new(
        rds_instance: &str,
        parameters: &BackupParameters,
        services: BackupServices,
        settings: Arc<JobSettings>,
    ) -> Result<Self, BackupError> {
        let record = JobRecord::new(
            rds_instance,
            parameters,
            services.store.clone(),
            &settings.backup_prefix,
            settings.status_url_ttl,
        )?;
        let names = ResourceNames::derive(rds_instance, &parameters.backup_id);
        let credential = MasterCredential::derive(&settings.credential_secret, &parameters.backup_id);

        Ok(Self {
            record,
            names,
            credential,
            services,
            settings,
            phase: Phase::Queued,
        })
    }

    /// Run the whole pipeline, publishing exactly one terminal status.
    ///
    /// On failure the status is set to 500 with the first line of the error,
    /// published, and the error is returned so the queue can retry.
    pub async fn run(&mut self) -> Result<StatusDocument, BackupError> {
        if let Err(e) = self.record.recover_status_url().await {
            warn!("Could not read existing status for {}: {}", self.record.backup_id(), e);
        }

        let result = match self.perform_backup().await {
            Ok(document) => Ok(document),
            Err(err) => {
                let summary = err.summary();
                error!(
                    backup_id = %self.record.backup_id(),
                    rds_instance = %self.record.rds_instance(),
                    phase = ?self.phase,
                    "Backup failed: {}",
                    err
                );
                self.phase = Phase::Failed;
                if !self.record.is_terminal() {
                    if let Err(publish_err) = self.record.finish(STATUS_FAILED, summary).await {
                        error!("Failed to publish failure status: {}", publish_err);
                    }
                }
                Err(err)
            }
        };

        self.notify().await;
        result
    }

    async fn perform_backup(&mut self) -> Result<StatusDocument, BackupError> {
        let (original, resume) = self.prepare().await?;
        self.snapshot_original(resume).await?;
        self.create_clone_from_snapshot(&original, resume).await?;
        self.wait_for_clone().await?;
        let parameter_group = self.configure_clone(&original).await?;
        self.wait_for_security_group().await?;
        self.wait_for_parameter_group(&parameter_group).await?;
        self.destroy_snapshot().await?;
        let exported = self.export(&original).await?;
        self.delete_clone().await?;
        self.upload(&exported).await?;

        self.enter(Phase::Complete);
        let message = format!("Backup of {} complete", self.record.rds_instance());
        self.record.finish(STATUS_OK, message).await
    }

    fn enter(&mut self, phase: Phase) {
        debug!(backup_id = %self.record.backup_id(), "{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn database(&self) -> &dyn DatabaseService {
        self.services.database.as_ref()
    }

    /// Looks up the original instance and anything an earlier attempt left behind
    async fn prepare(&mut self) -> Result<(InstanceInfo, ResumePoint), BackupError> {
        self.enter(Phase::Preparing);
        let message = format!(
            "Backing up {} from account {}",
            self.record.rds_instance(),
            self.record.account_name()
        );
        self.record.update_status(message).await?;

        let rds_instance = self.record.rds_instance().to_string();
        let original = self
            .database()
            .describe_instance(&rds_instance)
            .await?
            .ok_or(BackupError::InstanceNotFound(rds_instance))?;

        let mut clone = self.database().describe_instance(&self.names.clone_id).await?;
        if clone.as_ref().is_some_and(|c| c.status == INSTANCE_DELETING) {
            // an earlier attempt already deleted the clone; start over once it is gone
            self.wait_for_clone_removal().await?;
            clone = None;
        }
        let snapshot = self.database().describe_snapshot(&self.names.snapshot_id).await?;
        let resume = ResumePoint::from_probes(snapshot.is_some(), clone.is_some());
        if resume != ResumePoint::Fresh {
            info!(
                backup_id = %self.record.backup_id(),
                "Resuming from {:?} (snapshot {}, clone {})",
                resume,
                self.names.snapshot_id,
                self.names.clone_id
            );
        }

        Ok((original, resume))
    }

    async fn wait_for_clone_removal(&mut self) -> Result<(), BackupError> {
        let clone_id = self.names.clone_id.clone();
        self.record
            .update_status(format!("Waiting for RDS instance {} to be deleted", clone_id))
            .await?;
        let database = self.database();
        poll_until(&self.settings.poll, || probe_instance_gone(database, &clone_id))
            .await
            .map_err(|e| BackupError::from_poll(&format!("deletion of RDS instance {}", clone_id), e))
    }

    async fn wait_for_instance_ready(&self, instance_id: &str) -> Result<InstanceInfo, BackupError> {
        let database = self.database();
        poll_until(&self.settings.poll, || probe_instance_ready(database, instance_id))
            .await
            .map_err(|e| BackupError::from_poll(&format!("RDS instance {}", instance_id), e))
    }

    async fn snapshot_original(&mut self, resume: ResumePoint) -> Result<(), BackupError> {
        if resume == ResumePoint::CloneExists {
            return Ok(());
        }

        let snapshot_id = self.names.snapshot_id.clone();
        if resume == ResumePoint::Fresh {
            self.enter(Phase::Snapshotting);
            let rds_instance = self.record.rds_instance().to_string();
            self.record
                .update_status(format!("Waiting for RDS instance {}", rds_instance))
                .await?;
            self.wait_for_instance_ready(&rds_instance).await?;

            self.record
                .update_status(format!(
                    "Creating snapshot {} from RDS {}",
                    snapshot_id, rds_instance
                ))
                .await?;
            self.database()
                .create_snapshot(&snapshot_id, &rds_instance)
                .await?;
        }

        self.record
            .update_status(format!("Waiting for snapshot {}", snapshot_id))
            .await?;
        let database = self.database();
        poll_until(&self.settings.poll, || probe_snapshot_ready(database, &snapshot_id))
            .await
            .map_err(|e| BackupError::from_poll(&format!("snapshot {}", snapshot_id), e))?;
        self.enter(Phase::SnapshotReady);
        Ok(())
    }

    async fn create_clone_from_snapshot(
        &mut self,
        original: &InstanceInfo,
        resume: ResumePoint,
    ) -> Result<(), BackupError> {
        if resume == ResumePoint::CloneExists {
            return Ok(());
        }
        self.enter(Phase::Cloning);
        let request = RestoreRequest {
            instance_id: self.names.clone_id.clone(),
            snapshot_id: self.names.snapshot_id.clone(),
            instance_class: original.instance_class.clone(),
        };
        self.record
            .update_status(format!(
                "Booting new RDS {} from snapshot {}",
                request.instance_id, request.snapshot_id
            ))
            .await?;
        self.database().restore_from_snapshot(&request).await?;
        Ok(())
    }

    async fn wait_for_clone(&mut self) -> Result<(), BackupError> {
        let clone_id = self.names.clone_id.clone();
        self.record
            .update_status(format!("Waiting for new RDS instance {}", clone_id))
            .await?;
        self.wait_for_instance_ready(&clone_id).await?;
        self.enter(Phase::CloneReady);
        Ok(())
    }

    /// Applies the original's parameter group, the restricted network group and
    /// the job's one-time master credential. Returns the parameter group name.
    async fn configure_clone(&mut self, original: &InstanceInfo) -> Result<String, BackupError> {
        self.enter(Phase::Configuring);
        let parameter_group = original
            .primary_parameter_group()
            .ok_or_else(|| BackupError::MissingAttribute {
                instance: original.id.clone(),
                what: "parameter group",
            })?
            .to_string();

        let request = ModifyRequest {
            instance_id: self.names.clone_id.clone(),
            parameter_group: parameter_group.clone(),
            security_group: self.settings.security_group.clone(),
            master_password: self.credential.expose().to_string(),
        };
        self.record
            .update_status(format!(
                "Modifying RDS attributes for new RDS {}",
                request.instance_id
            ))
            .await?;
        self.database().modify_instance(&request).await?;
        Ok(parameter_group)
    }

    async fn wait_for_security_group(&mut self) -> Result<(), BackupError> {
        let clone_id = self.names.clone_id.clone();
        let group = self.settings.security_group.clone();
        self.record
            .update_status(format!("Applying security group {} to {}", group, clone_id))
            .await?;

        let database = self.database();
        poll_until(&self.settings.poll, || probe_security_group(database, &clone_id, &group))
            .await
            .map_err(|e| {
                BackupError::from_poll(&format!("security group {} on {}", group, clone_id), e)
            })?;
        self.enter(Phase::SecurityGroupApplied);
        Ok(())
    }

    /// Waits for `in-sync`. Every `pending-reboot` observation costs exactly
    /// one reboot followed by a wait for the clone to come back.
    async fn wait_for_parameter_group(&mut self, group: &str) -> Result<(), BackupError> {
        let clone_id = self.names.clone_id.clone();
        self.record
            .update_status(format!("Applying parameter group {} to {}", group, clone_id))
            .await?;

        let mut reboots = 0;
        loop {
            let database = self.database();
            let sync = poll_until(&self.settings.poll, || {
                probe_parameter_group(database, &clone_id, group)
            })
            .await
            .map_err(|e| {
                BackupError::from_poll(&format!("parameter group {} on {}", group, clone_id), e)
            })?;

            match sync {
                ParameterSync::InSync => break,
                ParameterSync::PendingReboot => {
                    if reboots >= self.settings.max_reboots {
                        return Err(BackupError::RebootLimit {
                            instance: clone_id,
                            group: group.to_string(),
                            reboots,
                        });
                    }
                    reboots += 1;
                    self.record
                        .update_status(format!(
                            "Rebooting RDS {} to apply ParameterGroup {}",
                            clone_id, group
                        ))
                        .await?;
                    self.database().reboot_instance(&clone_id).await?;
                    self.wait_for_instance_ready(&clone_id).await?;
                }
            }
        }

        self.enter(Phase::ParameterGroupApplied);
        Ok(())
    }

    async fn destroy_snapshot(&mut self) -> Result<(), BackupError> {
        let snapshot_id = self.names.snapshot_id.clone();
        if self.database().describe_snapshot(&snapshot_id).await?.is_some() {
            self.record
                .update_status(format!("Deleting snapshot {}", snapshot_id))
                .await?;
            self.database().delete_snapshot(&snapshot_id).await?;
        } else {
            debug!("Snapshot {} already gone", snapshot_id);
        }
        self.enter(Phase::SnapshotDeleted);
        Ok(())
    }

    async fn export(&mut self, original: &InstanceInfo) -> Result<ExportedFile, BackupError> {
        self.enter(Phase::Exporting);
        let clone_id = self.names.clone_id.clone();
        let clone = self.wait_for_instance_ready(&clone_id).await?;
        let endpoint = clone.endpoint.clone().ok_or_else(|| BackupError::MissingAttribute {
            instance: clone_id.clone(),
            what: "endpoint",
        })?;

        let file_name = dump_file_name(original.db_name.as_deref(), self.record.requested());
        let destination = self
            .record
            .paths()
            .scratch_file(&self.settings.scratch_dir, &file_name);
        let request = ExportRequest {
            engine: Engine::from_engine_name(&original.engine),
            endpoint,
            username: original.master_username.clone(),
            password: self.credential.clone(),
            db_name: original.db_name.clone(),
            destination,
        };

        self.record
            .update_status(format!(
                "Dumping database {} from {}",
                original.db_name.as_deref().unwrap_or("(all)"),
                clone_id
            ))
            .await?;
        Ok(self.services.exporter.export(&request).await?)
    }

    async fn delete_clone(&mut self) -> Result<(), BackupError> {
        let clone_id = self.names.clone_id.clone();
        self.record
            .update_status(format!("Deleting RDS instance {}", clone_id))
            .await?;
        self.database().delete_instance(&clone_id).await?;
        self.enter(Phase::CloneDeleted);
        Ok(())
    }

    async fn upload(&mut self, exported: &ExportedFile) -> Result<(), BackupError> {
        let file_name = exported
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record
            .update_status(format!("Uploading output file {}", file_name))
            .await?;

        let key = self.record.paths().artifact_key(&file_name);
        let store = &self.services.store;
        store.put_file(&key, &exported.path).await?;
        let size = store.object_size(&key).await?.unwrap_or(exported.size);
        let url = store.signed_url(&key, self.settings.artifact_url_ttl).await?;
        self.record.set_files(vec![BackupFile {
            name: file_name,
            size,
            url,
        }]);

        tokio::fs::remove_file(&exported.path)
            .await
            .map_err(|source| BackupError::Io {
                context: format!("removing {}", exported.path.display()),
                source,
            })?;
        self.enter(Phase::Uploaded);
        Ok(())
    }

    async fn notify(&self) {
        let (Some(notifier), Some(recipient)) =
            (&self.services.notifier, self.record.option(NOTIFY_OPTION))
        else {
            return;
        };
        let notification =
            Notification::for_job(recipient, self.record.backup_id(), &self.record.document());
        if let Err(e) = notifier.send(&notification).await {
            warn!("Failed to notify {}: {}", recipient, e);
        }
    }
}

/// Queue entry point: rehydrate the job from its parameters and run it
pub async fn perform(
    rds_instance: &str,
    parameters: &BackupParameters,
    services: BackupServices,
    settings: Arc<JobSettings>,
) -> Result<StatusDocument, BackupError> {
    let mut job = BackupJob::new(rds_instance, parameters, services, settings)?;
    job.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_point_prefers_clone() {
        assert_eq!(ResumePoint::from_probes(false, false), ResumePoint::Fresh);
        assert_eq!(ResumePoint::from_probes(true, false), ResumePoint::SnapshotExists);
        assert_eq!(ResumePoint::from_probes(true, true), ResumePoint::CloneExists);
        assert_eq!(ResumePoint::from_probes(false, true), ResumePoint::CloneExists);
    }
}
