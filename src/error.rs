use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("Remote node unavailable during {action}: {reason}")]
    RemoteUnavailable { action: String, reason: String },

    #[error("Remote protocol error during {action}: {reason}")]
    RemoteProtocolError { action: String, reason: String },

    #[error("Account enumeration stalled at cursor {cursor} ({collected} of {expected} accounts collected)")]
    EnumerationStalled {
        cursor: String,
        collected: u64,
        expected: u64,
    },

    #[error("Failed to persist {}: {source}", .path.display())]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rebuild cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DistributionError>;

impl DistributionError {
    pub fn unavailable(action: &str, reason: impl ToString) -> Self {
        DistributionError::RemoteUnavailable {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(action: &str, reason: impl ToString) -> Self {
        DistributionError::RemoteProtocolError {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DistributionError::PersistenceFailure {
            path: path.into(),
            source,
        }
    }

    /// Only transport-level failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, DistributionError::RemoteUnavailable { .. })
    }
}

impl From<String> for DistributionError {
    fn from(msg: String) -> Self {
        DistributionError::Other(msg)
    }
}

impl From<&str> for DistributionError {
    fn from(msg: &str) -> Self {
        DistributionError::Other(msg.to_string())
    }
}
