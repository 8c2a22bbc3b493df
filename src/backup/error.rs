use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;

use super::export::ExportError;
use super::poll::PollError;

/// Everything that can stop a backup pipeline
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("RDS instance {0} not found")]
    InstanceNotFound(String),

    #[error("RDS instance {instance} has no {what}")]
    MissingAttribute { instance: String, what: &'static str },

    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("timed out after {}s waiting for {what}", waited.as_secs())]
    TimedOut { what: String, waited: Duration },

    #[error("parameter group {group} still pending reboot after {reboots} reboots of {instance}")]
    RebootLimit {
        instance: String,
        group: String,
        reboots: u32,
    },

    #[error("failed to serialize status document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job {0} already reached a terminal status")]
    AlreadyTerminal(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    /// First line of the error message, used as the failure status message
    pub fn summary(&self) -> String {
        self.to_string().lines().next().unwrap_or_default().to_string()
    }

    pub(crate) fn from_poll(what: &str, err: PollError<BackupError>) -> Self {
        match err {
            PollError::Probe(err) => err,
            PollError::TimedOut { waited } => BackupError::TimedOut {
                what: what.to_string(),
                waited,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keeps_only_first_line() {
        let err = BackupError::Cloud(CloudError::Database(
            "restore instance clone: InvalidParameterCombination\n  caused by: boom".into(),
        ));
        assert_eq!(
            err.summary(),
            "database service error: restore instance clone: InvalidParameterCombination"
        );
    }

    #[test]
    fn timeout_message_names_the_wait() {
        let err = BackupError::from_poll(
            "snapshot s1",
            PollError::TimedOut {
                waited: Duration::from_secs(90),
            },
        );
        assert_eq!(err.summary(), "timed out after 90s waiting for snapshot s1");
    }
}
