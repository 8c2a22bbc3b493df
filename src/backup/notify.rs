use async_trait::async_trait;
use tracing::info;

use super::status::{StatusDocument, STATUS_OK};

/// Job option naming the notification recipient
pub const NOTIFY_OPTION: &str = "email";

/// Final-status message for whoever requested the backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn for_job(recipient: &str, backup_id: &str, document: &StatusDocument) -> Self {
        let mut body = String::from("Hello.\n\n");
        if document.backup_status == STATUS_OK {
            body.push_str(&format!(
                "Your backup of database {} is complete.\n",
                document.rds_instance
            ));
            if let Some(file) = document.files.first() {
                body.push_str(&format!("Output is at {}\n", file.url));
            }
        } else {
            body.push_str(&format!("Your backup is incomplete. (job ID {})\n", backup_id));
        }
        body.push_str(&format!("Job status: {}\n", document.status_message));

        Self {
            recipient: recipient.to_string(),
            subject: format!(
                "Backup of RDS {} (job ID {})",
                document.rds_instance, backup_id
            ),
            body,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), String>;
}

/// Writes notifications to the log instead of delivering them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), String> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Notification: {}",
            notification.body.trim_end()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::status::{BackupFile, STATUS_FAILED};

    fn doc(status: u16, message: &str, files: Vec<BackupFile>) -> StatusDocument {
        StatusDocument {
            rds_instance: "orders-db".into(),
            account_name: "prod".into(),
            backup_status: status,
            status_message: message.into(),
            status_url: Some("https://status".into()),
            files,
        }
    }

    #[test]
    fn success_message_links_artifact() {
        let file = BackupFile {
            name: "orders.sql.gz".into(),
            size: 10,
            url: "https://artifact".into(),
        };
        let n = Notification::for_job(
            "ops@example.com",
            "abc",
            &doc(STATUS_OK, "Backup of orders-db complete", vec![file]),
        );
        assert_eq!(n.subject, "Backup of RDS orders-db (job ID abc)");
        assert!(n.body.contains("is complete"));
        assert!(n.body.contains("Output is at https://artifact"));
        assert!(n.body.ends_with("Job status: Backup of orders-db complete\n"));
    }

    #[test]
    fn failure_message_names_job() {
        let n = Notification::for_job(
            "ops@example.com",
            "abc",
            &doc(STATUS_FAILED, "timed out", vec![]),
        );
        assert!(n.body.contains("incomplete. (job ID abc)"));
        assert!(!n.body.contains("Output is at"));
    }
}
