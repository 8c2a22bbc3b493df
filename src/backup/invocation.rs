use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::BackupError;
use super::naming::{generate_backup_id, validate_backup_id};

/// Serialized arguments of `perform`. Only strings, so they survive any queue
/// transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupParameters {
    pub backup_id: String,
    /// RFC 3339, second precision
    pub requested: String,
    pub account_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BackupParameters {
    /// Identity for a brand new job requested now
    pub fn new(account_name: &str, options: BTreeMap<String, String>) -> Self {
        Self {
            backup_id: generate_backup_id(),
            requested: format_requested(Utc::now()),
            account_name: account_name.to_string(),
            status_url: None,
            options,
        }
    }

    pub fn requested_at(&self) -> Result<DateTime<Utc>, BackupError> {
        DateTime::parse_from_rfc3339(&self.requested)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                BackupError::InvalidParameters(format!("requested {:?}: {}", self.requested, e))
            })
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        validate_backup_id(&self.backup_id).map_err(BackupError::InvalidParameters)?;
        if self.account_name.is_empty() {
            return Err(BackupError::InvalidParameters("account_name is empty".into()));
        }
        self.requested_at().map(|_| ())
    }
}

pub fn format_requested(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One queued call of `perform(rds_instance, parameters)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInvocation {
    pub rds_instance: String,
    pub parameters: BackupParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn survives_json_round_trip() {
        let mut options = BTreeMap::new();
        options.insert("email".to_string(), "ops@example.com".to_string());
        let invocation = BackupInvocation {
            rds_instance: "orders-db".into(),
            parameters: BackupParameters::new("prod", options),
        };

        let json = serde_json::to_value(&invocation).unwrap();
        let back: BackupInvocation = serde_json::from_value(json).unwrap();
        assert_eq!(back, invocation);
        assert!(back.parameters.validate().is_ok());
    }

    #[test]
    fn requested_keeps_second_precision() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let params = BackupParameters {
            backup_id: "abc".into(),
            requested: format_requested(at),
            account_name: "prod".into(),
            status_url: None,
            options: BTreeMap::new(),
        };
        assert_eq!(params.requested, "2024-01-02T03:04:05Z");
        assert_eq!(params.requested_at().unwrap(), at);
    }

    #[test]
    fn minimal_payload_deserializes() {
        let params: BackupParameters = serde_json::from_str(
            r#"{"backup_id":"abc","requested":"2024-01-02T03:04:05Z","account_name":"prod"}"#,
        )
        .unwrap();
        assert!(params.options.is_empty());
        assert_eq!(params.status_url, None);
    }

    #[test]
    fn rejects_bad_identity() {
        let mut params = BackupParameters::new("prod", BTreeMap::new());
        params.requested = "yesterday".into();
        assert!(matches!(params.validate(), Err(BackupError::InvalidParameters(_))));

        let mut params = BackupParameters::new("prod", BTreeMap::new());
        params.backup_id = "../etc".into();
        assert!(params.validate().is_err());
    }
}
