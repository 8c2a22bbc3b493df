//! Deterministic in-memory stand-ins for the external services.
//!
//! [`FakeDatabaseService`] moves every requested change through an
//! intermediate status that clears after a fixed number of `describe` calls,
//! which is how the real service looks from a polling client.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::backup::export::{ExportError, ExportRequest, ExportedFile, Exporter};
use crate::backup::notify::{Notification, Notifier};
use crate::backup::BackupInvocation;
use crate::cloud::database::AVAILABLE;
use crate::cloud::{
    CloudError, DatabaseService, Endpoint, GroupStatus, InstanceInfo, ModifyRequest, ObjectStore,
    RestoreRequest, SnapshotInfo,
};
use crate::queue::{JobQueue, QueueError};

/// Mutating operations of the fake database service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    CreateSnapshot,
    Restore,
    Modify,
    Reboot,
    DeleteSnapshot,
    DeleteInstance,
}

/// Everything the fake observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    /// A describe call and the instance or snapshot status it returned
    Described { id: String, status: String },
    Mutated { op: FakeOp, id: String },
}

/// A status that becomes `next` after `remaining` more describe calls
#[derive(Debug, Clone)]
struct Countdown {
    remaining: u32,
    next: String,
}

impl Countdown {
    fn tick(slot: &mut Option<Countdown>, target: &mut String) {
        if let Some(countdown) = slot {
            if countdown.remaining <= 1 {
                *target = countdown.next.clone();
                *slot = None;
            } else {
                countdown.remaining -= 1;
            }
        }
    }
}

struct FakeInstance {
    info: InstanceInfo,
    status: Option<Countdown>,
    security_group: Option<Countdown>,
    parameter_group: Option<Countdown>,
    /// Describe calls left before a deleting instance disappears
    removal: Option<u32>,
}

impl FakeInstance {
    fn ready(info: InstanceInfo) -> Self {
        Self {
            info,
            status: None,
            security_group: None,
            parameter_group: None,
            removal: None,
        }
    }

    /// True once a deleting instance has run out of describe calls
    fn gone(&mut self) -> bool {
        match self.removal.as_mut() {
            Some(remaining) if *remaining <= 1 => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    fn tick(&mut self) {
        Countdown::tick(&mut self.status, &mut self.info.status);
        if let Some(group) = self.info.security_groups.first_mut() {
            Countdown::tick(&mut self.security_group, &mut group.status);
        }
        if let Some(group) = self.info.parameter_groups.first_mut() {
            Countdown::tick(&mut self.parameter_group, &mut group.status);
        }
    }
}

struct FakeSnapshot {
    info: SnapshotInfo,
    status: Option<Countdown>,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<String, FakeInstance>,
    snapshots: HashMap<String, FakeSnapshot>,
    events: Vec<FakeEvent>,
    modifications: Vec<ModifyRequest>,
    failures: HashMap<FakeOp, String>,
}

/// In-memory managed database service
pub struct FakeDatabaseService {
    polls_per_transition: u32,
    requires_reboot: AtomicBool,
    state: Mutex<FakeState>,
}

impl FakeDatabaseService {
    /// Every asynchronous change needs `polls_per_transition` describe calls to settle
    pub fn new(polls_per_transition: u32) -> Self {
        Self {
            polls_per_transition: polls_per_transition.max(1),
            requires_reboot: AtomicBool::new(false),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// A ready MySQL instance with its own parameter group
    pub fn source_instance(id: &str) -> InstanceInfo {
        InstanceInfo {
            id: id.to_string(),
            status: AVAILABLE.to_string(),
            instance_class: "db.t3.medium".to_string(),
            engine: "mysql".to_string(),
            db_name: Some("app".to_string()),
            master_username: "admin".to_string(),
            endpoint: Some(Endpoint {
                address: format!("{}.fake-rds.local", id),
                port: 3306,
            }),
            parameter_groups: vec![GroupStatus {
                name: format!("{}-params", id),
                status: "in-sync".to_string(),
            }],
            security_groups: vec![GroupStatus {
                name: "sg-production".to_string(),
                status: "active".to_string(),
            }],
        }
    }

    pub fn add_instance(&self, info: InstanceInfo) {
        self.state
            .lock()
            .instances
            .insert(info.id.clone(), FakeInstance::ready(info));
    }

    /// Set the status of an existing instance, e.g. to simulate a busy source
    pub fn set_instance_status(&self, id: &str, status: &str, polls_until_available: u32) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.info.status = status.to_string();
            instance.status = Some(Countdown {
                remaining: polls_until_available.max(1),
                next: AVAILABLE.to_string(),
            });
        }
    }

    /// Put an existing instance into `deleting`; it vanishes after `polls_until_gone` describes
    pub fn set_instance_deleting(&self, id: &str, polls_until_gone: u32) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.info.status = "deleting".to_string();
            instance.status = None;
            instance.removal = Some(polls_until_gone.max(1));
        }
    }

    pub fn add_snapshot(&self, id: &str, instance_id: &str, status: &str) {
        self.state.lock().snapshots.insert(
            id.to_string(),
            FakeSnapshot {
                info: SnapshotInfo {
                    id: id.to_string(),
                    instance_id: instance_id.to_string(),
                    status: status.to_string(),
                    created_at: Some(Utc::now()),
                },
                status: None,
            },
        );
    }

    /// Make every parameter-group change land in `pending-reboot`
    pub fn require_reboot(&self, required: bool) {
        self.requires_reboot.store(required, Ordering::SeqCst);
    }

    /// The next call of `op` fails with a two-line error
    pub fn fail_on(&self, op: FakeOp) {
        self.state.lock().failures.insert(
            op,
            format!("injected {:?} failure\nrequest id: 0000-fake", op),
        );
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.lock().events.clone()
    }

    pub fn count(&self, op: FakeOp) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, FakeEvent::Mutated { op: o, .. } if *o == op))
            .count()
    }

    pub fn has_instance(&self, id: &str) -> bool {
        self.state.lock().instances.contains_key(id)
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.state.lock().snapshots.contains_key(id)
    }

    /// Every accepted `modify_instance` request, in order
    pub fn modifications(&self) -> Vec<ModifyRequest> {
        self.state.lock().modifications.clone()
    }

    fn countdown(&self, next: &str) -> Option<Countdown> {
        Some(Countdown {
            remaining: self.polls_per_transition,
            next: next.to_string(),
        })
    }

    fn mutate(state: &mut FakeState, op: FakeOp, id: &str) -> Result<(), CloudError> {
        if let Some(message) = state.failures.remove(&op) {
            return Err(CloudError::Database(message));
        }
        state.events.push(FakeEvent::Mutated {
            op,
            id: id.to_string(),
        });
        Ok(())
    }
}

fn not_found(kind: &str, id: &str) -> CloudError {
    CloudError::Database(format!("{} {} not found", kind, id))
}

#[async_trait]
impl DatabaseService for FakeDatabaseService {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, CloudError> {
        let mut state = self.state.lock();
        let gone = state
            .instances
            .get_mut(instance_id)
            .is_some_and(|instance| instance.gone());
        if gone {
            state.instances.remove(instance_id);
        }
        let info = state.instances.get_mut(instance_id).map(|instance| {
            instance.tick();
            instance.info.clone()
        });
        if let Some(info) = &info {
            state.events.push(FakeEvent::Described {
                id: instance_id.to_string(),
                status: info.status.clone(),
            });
        }
        Ok(info)
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>, CloudError> {
        let mut state = self.state.lock();
        let info = state.snapshots.get_mut(snapshot_id).map(|snapshot| {
            Countdown::tick(&mut snapshot.status, &mut snapshot.info.status);
            snapshot.info.clone()
        });
        if let Some(info) = &info {
            state.events.push(FakeEvent::Described {
                id: snapshot_id.to_string(),
                status: info.status.clone(),
            });
        }
        Ok(info)
    }

    async fn create_snapshot(&self, snapshot_id: &str, instance_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if state.snapshots.contains_key(snapshot_id) {
            return Err(CloudError::Database(format!(
                "DBSnapshotAlreadyExists: {}",
                snapshot_id
            )));
        }
        if !state.instances.contains_key(instance_id) {
            return Err(not_found("instance", instance_id));
        }
        Self::mutate(&mut state, FakeOp::CreateSnapshot, snapshot_id)?;
        state.snapshots.insert(
            snapshot_id.to_string(),
            FakeSnapshot {
                info: SnapshotInfo {
                    id: snapshot_id.to_string(),
                    instance_id: instance_id.to_string(),
                    status: "creating".to_string(),
                    created_at: Some(Utc::now()),
                },
                status: self.countdown(AVAILABLE),
            },
        );
        Ok(())
    }

    async fn restore_from_snapshot(&self, request: &RestoreRequest) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if state.instances.contains_key(&request.instance_id) {
            return Err(CloudError::Database(format!(
                "DBInstanceAlreadyExists: {}",
                request.instance_id
            )));
        }
        let source = state
            .snapshots
            .get(&request.snapshot_id)
            .ok_or_else(|| not_found("snapshot", &request.snapshot_id))?
            .info
            .instance_id
            .clone();
        let template = state
            .instances
            .get(&source)
            .map(|i| i.info.clone())
            .unwrap_or_else(|| Self::source_instance(&source));
        Self::mutate(&mut state, FakeOp::Restore, &request.instance_id)?;

        let port = template.endpoint.as_ref().map(|e| e.port).unwrap_or(3306);
        let info = InstanceInfo {
            id: request.instance_id.clone(),
            status: "creating".to_string(),
            instance_class: request.instance_class.clone(),
            endpoint: Some(Endpoint {
                address: format!("{}.fake-rds.local", request.instance_id),
                port,
            }),
            parameter_groups: vec![GroupStatus {
                name: "default.mysql8.0".to_string(),
                status: "in-sync".to_string(),
            }],
            security_groups: vec![GroupStatus {
                name: "sg-default".to_string(),
                status: "active".to_string(),
            }],
            ..template
        };
        state.instances.insert(
            request.instance_id.clone(),
            FakeInstance {
                info,
                status: self.countdown(AVAILABLE),
                security_group: None,
                parameter_group: None,
                removal: None,
            },
        );
        Ok(())
    }

    async fn modify_instance(&self, request: &ModifyRequest) -> Result<(), CloudError> {
        let settled = if self.requires_reboot.load(Ordering::SeqCst) {
            "pending-reboot"
        } else {
            "in-sync"
        };
        let status = self.countdown(AVAILABLE);
        let security_group = self.countdown("active");
        let parameter_group = self.countdown(settled);

        let mut state = self.state.lock();
        if !state.instances.contains_key(&request.instance_id) {
            return Err(not_found("instance", &request.instance_id));
        }
        Self::mutate(&mut state, FakeOp::Modify, &request.instance_id)?;
        if let Some(instance) = state.instances.get_mut(&request.instance_id) {
            instance.info.status = "modifying".to_string();
            instance.info.security_groups = vec![GroupStatus {
                name: request.security_group.clone(),
                status: "adding".to_string(),
            }];
            instance.info.parameter_groups = vec![GroupStatus {
                name: request.parameter_group.clone(),
                status: "applying".to_string(),
            }];
            instance.status = status;
            instance.security_group = security_group;
            instance.parameter_group = parameter_group;
        }
        state.modifications.push(request.clone());
        Ok(())
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let status = self.countdown(AVAILABLE);
        let mut state = self.state.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(not_found("instance", instance_id));
        }
        Self::mutate(&mut state, FakeOp::Reboot, instance_id)?;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.info.status = "rebooting".to_string();
            instance.status = status;
            for group in &mut instance.info.parameter_groups {
                if group.status == "pending-reboot" {
                    group.status = "in-sync".to_string();
                }
            }
        }
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if !state.snapshots.contains_key(snapshot_id) {
            return Err(not_found("snapshot", snapshot_id));
        }
        Self::mutate(&mut state, FakeOp::DeleteSnapshot, snapshot_id)?;
        state.snapshots.remove(snapshot_id);
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(not_found("instance", instance_id));
        }
        Self::mutate(&mut state, FakeOp::DeleteInstance, instance_id)?;
        state.instances.remove(instance_id);
        Ok(())
    }
}

/// In-memory bucket
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    history: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    signed: AtomicU64,
    fail_uploads: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            history: Mutex::new(BTreeMap::new()),
            signed: AtomicU64::new(0),
            fail_uploads: AtomicBool::new(false),
        }
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn put_count(&self, key: &str) -> usize {
        self.history.lock().get(key).map_or(0, Vec::len)
    }

    /// Every body written to `key`, oldest first
    pub fn history(&self, key: &str) -> Vec<Vec<u8>> {
        self.history.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn signed_url_count(&self) -> u64 {
        self.signed.load(Ordering::SeqCst)
    }

    /// Make every `put_file` fail
    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    fn store(&self, key: &str, body: Vec<u8>) {
        self.history
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(body.clone());
        self.objects.lock().insert(key.to_string(), body);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), CloudError> {
        self.store(key, body);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), CloudError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CloudError::Storage(format!("upload {} rejected", key)));
        }
        let body = tokio::fs::read(path).await.map_err(|source| CloudError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.store(key, body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, CloudError> {
        Ok(self.object(key))
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>, CloudError> {
        Ok(self.objects.lock().get(key).map(|body| body.len() as u64))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, CloudError> {
        let signature = self.signed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "https://{}.fake-store.local/{}?expires={}&sig={}",
            self.bucket,
            key,
            expires_in.as_secs(),
            signature
        ))
    }
}

/// Writes a small gzip file instead of running a dump tool
#[derive(Default)]
pub struct FakeExporter {
    requests: Mutex<Vec<ExportRequest>>,
    fail: AtomicBool,
}

impl FakeExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ExportRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Exporter for FakeExporter {
    async fn export(&self, request: &ExportRequest) -> Result<ExportedFile, ExportError> {
        self.requests.lock().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExportError::ToolFailed {
                tool: "fake-dump".into(),
                code: "2".into(),
                stderr: format!("Access denied for user '{}'", request.username),
            });
        }

        let destination = request.destination.clone();
        let content = format!(
            "-- dump of {} from {}\n",
            request.db_name.as_deref().unwrap_or("all"),
            request.endpoint.address
        );
        let write_err = |source| ExportError::Write {
            path: destination.display().to_string(),
            source,
        };
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).map_err(write_err)?;
        let compressed = encoder.finish().map_err(write_err)?;
        std::fs::write(&destination, &compressed).map_err(write_err)?;

        Ok(ExportedFile {
            path: destination.clone(),
            size: compressed.len() as u64,
        })
    }
}

/// Keeps every notification it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), String> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Queue that only remembers what was enqueued
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<BackupInvocation>>,
}

impl MemoryQueue {
    pub fn jobs(&self) -> Vec<BackupInvocation> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, invocation: &BackupInvocation) -> Result<i64, QueueError> {
        let mut jobs = self.jobs.lock();
        jobs.push(invocation.clone());
        Ok(jobs.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_becomes_available_after_polls() {
        let db = FakeDatabaseService::new(2);
        db.add_instance(FakeDatabaseService::source_instance("src"));
        db.create_snapshot("snap", "src").await.unwrap();

        let first = db.describe_snapshot("snap").await.unwrap().unwrap();
        let second = db.describe_snapshot("snap").await.unwrap().unwrap();
        assert_eq!(first.status, "creating");
        assert_eq!(second.status, "available");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let db = FakeDatabaseService::new(1);
        db.add_instance(FakeDatabaseService::source_instance("src"));
        db.fail_on(FakeOp::CreateSnapshot);

        assert!(db.create_snapshot("snap", "src").await.is_err());
        assert!(db.create_snapshot("snap", "src").await.is_ok());
        assert_eq!(db.count(FakeOp::CreateSnapshot), 1);
    }

    #[tokio::test]
    async fn deleting_instance_disappears_after_polls() {
        let db = FakeDatabaseService::new(1);
        db.add_instance(FakeDatabaseService::source_instance("clone"));
        db.set_instance_deleting("clone", 2);

        let first = db.describe_instance("clone").await.unwrap().unwrap();
        assert_eq!(first.status, "deleting");
        assert!(db.describe_instance("clone").await.unwrap().is_none());
        assert!(!db.has_instance("clone"));
    }

    #[tokio::test]
    async fn reboot_clears_pending_reboot() {
        let db = FakeDatabaseService::new(1);
        db.require_reboot(true);
        db.add_instance(FakeDatabaseService::source_instance("clone"));
        db.modify_instance(&ModifyRequest {
            instance_id: "clone".into(),
            parameter_group: "pg".into(),
            security_group: "sg".into(),
            master_password: "pw".into(),
        })
        .await
        .unwrap();

        let info = db.describe_instance("clone").await.unwrap().unwrap();
        assert_eq!(info.parameter_group_status("pg"), Some("pending-reboot"));
        assert_eq!(info.security_group_status("sg"), Some("active"));

        db.reboot_instance("clone").await.unwrap();
        let info = db.describe_instance("clone").await.unwrap().unwrap();
        assert_eq!(info.parameter_group_status("pg"), Some("in-sync"));
        assert!(info.is_ready());
    }
}
