//! Identifiers derived from job identity.
//!
//! Nothing here is random except [`generate_backup_id`]. Everything else is a
//! pure function of `(rds_instance, backup_id, requested)` so a restarted
//! worker finds the resources a previous attempt created.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const SNAPSHOT_PREFIX: &str = "rds-backup-service";
pub const CLONE_PREFIX: &str = "rbs";
pub const STATUS_FILE: &str = "status.json";

/// RDS limit for instance identifiers
const MAX_INSTANCE_ID_LEN: usize = 63;
const MAX_BACKUP_ID_LEN: usize = 32;
/// Hex characters of the source digest kept in a shortened clone id
const SOURCE_DIGEST_LEN: usize = 8;

/// A fresh 16-character lower-case hex job id
pub fn generate_backup_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// Backup ids end up inside resource identifiers, so only lower-case
/// alphanumerics are accepted.
pub fn validate_backup_id(backup_id: &str) -> Result<(), String> {
    if backup_id.is_empty() || backup_id.len() > MAX_BACKUP_ID_LEN {
        return Err(format!(
            "backup_id must be 1-{} characters, got {}",
            MAX_BACKUP_ID_LEN,
            backup_id.len()
        ));
    }
    if !backup_id
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
    {
        return Err(format!("backup_id {:?} must be lower-case alphanumeric", backup_id));
    }
    Ok(())
}

/// External identifiers of the temporary resources owned by one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub snapshot_id: String,
    pub clone_id: String,
}

impl ResourceNames {
    pub fn derive(rds_instance: &str, backup_id: &str) -> Self {
        let snapshot_id = format!("{}-{}-{}", SNAPSHOT_PREFIX, rds_instance, backup_id);

        let clone_id = clone_id(rds_instance, backup_id);

        Self {
            snapshot_id,
            clone_id,
        }
    }
}

/// `rbs-{backup_id}-{rds_instance}`. Past the length limit the source part is
/// cut and a digest of the full source name is appended, so sources sharing a
/// long prefix still get distinct clones.
fn clone_id(rds_instance: &str, backup_id: &str) -> String {
    let full = format!("{}-{}-{}", CLONE_PREFIX, backup_id, rds_instance);
    if full.len() <= MAX_INSTANCE_ID_LEN {
        return full;
    }

    let digest = hex_digest(&[rds_instance.as_bytes()]);
    let mut head = full;
    head.truncate(MAX_INSTANCE_ID_LEN - SOURCE_DIGEST_LEN - 1);
    format!(
        "{}-{}",
        head.trim_end_matches('-'),
        &digest[..SOURCE_DIGEST_LEN]
    )
}

fn hex_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Object-store and scratch locations for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    job_path: String,
}

impl JobPaths {
    /// `{prefix}/{yyyy}/{mm}/{dd}/{rds_instance}/{backup_id}`
    pub fn new(prefix: &str, requested: DateTime<Utc>, rds_instance: &str, backup_id: &str) -> Self {
        let date = requested.format("%Y/%m/%d");
        let prefix = prefix.trim_matches('/');
        let job_path = if prefix.is_empty() {
            format!("{}/{}/{}", date, rds_instance, backup_id)
        } else {
            format!("{}/{}/{}/{}", prefix, date, rds_instance, backup_id)
        };
        Self { job_path }
    }

    pub fn job_path(&self) -> &str {
        &self.job_path
    }

    pub fn status_key(&self) -> String {
        format!("{}/{}", self.job_path, STATUS_FILE)
    }

    pub fn artifact_key(&self, file_name: &str) -> String {
        format!("{}/{}", self.job_path, file_name)
    }

    pub fn scratch_file(&self, scratch_dir: &Path, file_name: &str) -> PathBuf {
        scratch_dir.join(&self.job_path).join(file_name)
    }
}

/// `{db_name}.{requested:%Y-%m-%d-%H%M%S}.sql.gz`
pub fn dump_file_name(db_name: Option<&str>, requested: DateTime<Utc>) -> String {
    format!(
        "{}.{}.sql.gz",
        db_name.unwrap_or("all-databases"),
        requested.format("%Y-%m-%d-%H%M%S")
    )
}

/// Master password applied to the clone. Derived rather than random so a
/// resumed job can still connect to a clone an earlier attempt configured.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterCredential(String);

impl MasterCredential {
    pub fn derive(secret: &str, backup_id: &str) -> Self {
        let hex = hex_digest(&[secret.as_bytes(), b":", backup_id.as_bytes()]);
        Self(hex[..32].to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MasterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterCredential(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_are_deterministic() {
        let a = ResourceNames::derive("orders-db", "00ff00ff00ff00ff");
        let b = ResourceNames::derive("orders-db", "00ff00ff00ff00ff");
        assert_eq!(a, b);
        assert_eq!(a.snapshot_id, "rds-backup-service-orders-db-00ff00ff00ff00ff");
        assert_eq!(a.clone_id, "rbs-00ff00ff00ff00ff-orders-db");
    }

    #[test]
    fn names_differ_across_sources_and_jobs() {
        let a = ResourceNames::derive("orders-db", "1111111111111111");
        let b = ResourceNames::derive("billing-db", "1111111111111111");
        let c = ResourceNames::derive("orders-db", "2222222222222222");
        assert_ne!(a.snapshot_id, b.snapshot_id);
        assert_ne!(a.clone_id, b.clone_id);
        assert_ne!(a.snapshot_id, c.snapshot_id);
        assert_ne!(a.clone_id, c.clone_id);
    }

    #[test]
    fn clone_id_respects_instance_limit() {
        let long_source = format!("a{}", "-b".repeat(40));
        let names = ResourceNames::derive(&long_source, "abcdef0123456789");
        assert!(names.clone_id.len() <= 63);
        assert!(!names.clone_id.ends_with('-'));
        assert!(names.clone_id.starts_with("rbs-abcdef0123456789-"));
    }

    #[test]
    fn long_sources_with_a_shared_prefix_get_distinct_clones() {
        let backup_id = "nightlyorders20240506weekly00001";
        let east = ResourceNames::derive("analytics-warehouse-replica-east-1", backup_id);
        let west = ResourceNames::derive("analytics-warehouse-replica-west-2", backup_id);

        assert_ne!(east.clone_id, west.clone_id);
        for names in [&east, &west] {
            assert_eq!(names.clone_id.len(), 63);
            assert!(names.clone_id.starts_with("rbs-nightlyorders20240506weekly00001-analytics"));
            assert!(!names.clone_id.contains("--"));
        }
        assert_eq!(
            east,
            ResourceNames::derive("analytics-warehouse-replica-east-1", backup_id)
        );
    }

    #[test]
    fn short_clone_ids_are_not_hashed() {
        let names = ResourceNames::derive("orders-db", "nightlyorders20240506weekly00001");
        assert_eq!(names.clone_id, "rbs-nightlyorders20240506weekly00001-orders-db");
    }

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..32 {
            let id = generate_backup_id();
            assert_eq!(id.len(), 16);
            assert!(validate_backup_id(&id).is_ok());
        }
    }

    #[test]
    fn rejects_unsafe_backup_ids() {
        assert!(validate_backup_id("").is_err());
        assert!(validate_backup_id("ABC").is_err());
        assert!(validate_backup_id("a/b").is_err());
        assert!(validate_backup_id(&"a".repeat(33)).is_err());
        assert!(validate_backup_id("nightly42").is_ok());
    }

    #[test]
    fn paths_are_namespaced_by_date_source_and_job() {
        let requested = Utc.with_ymd_and_hms(2024, 3, 7, 4, 5, 6).unwrap();
        let paths = JobPaths::new("backups/", requested, "orders-db", "abc123");
        assert_eq!(paths.job_path(), "backups/2024/03/07/orders-db/abc123");
        assert_eq!(
            paths.status_key(),
            "backups/2024/03/07/orders-db/abc123/status.json"
        );
        assert_eq!(
            paths.scratch_file(Path::new("/scratch"), "orders.sql.gz"),
            PathBuf::from("/scratch/backups/2024/03/07/orders-db/abc123/orders.sql.gz")
        );

        let bare = JobPaths::new("", requested, "orders-db", "abc123");
        assert_eq!(bare.job_path(), "2024/03/07/orders-db/abc123");
    }

    #[test]
    fn dump_name_uses_request_time() {
        let requested = Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 6).unwrap();
        assert_eq!(
            dump_file_name(Some("orders"), requested),
            "orders.2024-03-07-140506.sql.gz"
        );
        assert_eq!(
            dump_file_name(None, requested),
            "all-databases.2024-03-07-140506.sql.gz"
        );
    }

    #[test]
    fn credential_is_stable_and_secret_dependent() {
        let a = MasterCredential::derive("s3cret", "abc");
        let b = MasterCredential::derive("s3cret", "abc");
        let c = MasterCredential::derive("other", "abc");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.expose().len(), 32);
        assert_eq!(format!("{:?}", a), "MasterCredential(<redacted>)");
    }
}
