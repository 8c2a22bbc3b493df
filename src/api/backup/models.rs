use std::collections::BTreeMap;

use serde::Deserialize;
use validator::Validate;

use crate::backup::notify::NOTIFY_OPTION;

/// Body of `POST {api_root}/backups`
#[derive(Deserialize, Debug, Validate)]
pub struct BackupRequest {
    #[validate(
        required(message = "Parameter 'rds_instance' required"),
        length(min = 1, message = "Parameter 'rds_instance' required")
    )]
    pub rds_instance: Option<String>,

    /// Where to send the final status
    #[validate(email(message = "Parameter 'email' must be an email address"))]
    pub email: Option<String>,

    /// Free-form job options carried to the worker
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BackupRequest {
    /// Options bag for the job, with `email` folded in
    pub fn job_options(&self) -> BTreeMap<String, String> {
        let mut options = self.options.clone();
        if let Some(email) = &self.email {
            options.insert(NOTIFY_OPTION.to_string(), email.clone());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_instance_fails_validation() {
        let request: BackupRequest = serde_json::from_str("{}").unwrap();
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("rds_instance"));
    }

    #[test]
    fn email_becomes_an_option() {
        let request: BackupRequest = serde_json::from_str(
            r#"{"rds_instance": "orders-db", "email": "dba@example.com", "options": {"team": "core"}}"#,
        )
        .unwrap();
        assert!(request.validate().is_ok());

        let options = request.job_options();
        assert_eq!(options.get("email").map(String::as_str), Some("dba@example.com"));
        assert_eq!(options.get("team").map(String::as_str), Some("core"));
    }

    #[test]
    fn rejects_malformed_email() {
        let request: BackupRequest =
            serde_json::from_str(r#"{"rds_instance": "orders-db", "email": "nope"}"#).unwrap();
        assert!(request.validate().is_err());
    }
}
