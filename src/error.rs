//! ShardSync Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ShardSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes, carried over the wire and in sync reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Generic failure (cancelled, already done, plan changed)
    Failed,
    /// Server is shutting down
    ShuttingDown,
    /// Configured attempt timeout exceeded
    AttemptTimeoutExceeded,
    /// Leader and follower document counts disagree
    WrongChecksum,
    /// Job was rescheduled with a lower priority
    ActionUnfinished,
    /// Database does not exist (on the leader or locally)
    DatabaseNotFound,
    /// Collection or shard does not exist
    DataSourceNotFound,
    /// Could not reach the remote endpoint at all
    CouldNotConnect,
    /// Request timed out
    Timeout,
    /// Leader refuses because the shard is not empty
    ShardNonEmpty,
    /// Lock id is unknown on the leader
    LockNotFound,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Failed => "FAILED",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::AttemptTimeoutExceeded => "SHARD_SYNC_ATTEMPT_TIMEOUT_EXCEEDED",
            ErrorCode::WrongChecksum => "WRONG_CHECKSUM",
            ErrorCode::ActionUnfinished => "ACTION_UNFINISHED",
            ErrorCode::DatabaseNotFound => "DATABASE_NOT_FOUND",
            ErrorCode::DataSourceNotFound => "DATA_SOURCE_NOT_FOUND",
            ErrorCode::CouldNotConnect => "COULD_NOT_CONNECT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ShardNonEmpty => "SHARD_NONEMPTY",
            ErrorCode::LockNotFound => "LOCK_NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// ShardSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Lifecycle
    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Synchronization cancelled: {0}")]
    PlanChanged(String),

    #[error("Shard synchronization attempt timeout exceeded")]
    AttemptTimeout,

    #[error("Action rescheduled to slow operation priority")]
    Requeued,

    // Leader interaction
    #[error("Leader error [{code}]: {message}")]
    Rpc { code: ErrorCode, message: String },

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Wrong checksum: {0}")]
    ChecksumMismatch(String),

    #[error("Failed to release lock on leader: {0}")]
    LockRelease(String),

    // Local data
    #[error("Shard {database}/{shard} seems to be gone from leader")]
    ShardVanished { database: String, shard: String },

    #[error("Local shard not found: {0}")]
    CollectionNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an error from a leader response
    pub fn rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Rpc { code, message: message.into() }
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            Error::PlanChanged(_) => ErrorCode::Failed,
            Error::AttemptTimeout => ErrorCode::AttemptTimeoutExceeded,
            Error::Requeued => ErrorCode::ActionUnfinished,
            Error::Rpc { code, .. } => *code,
            Error::ConnectionFailed { .. } => ErrorCode::CouldNotConnect,
            Error::ConnectionTimeout(_) => ErrorCode::Timeout,
            Error::ChecksumMismatch(_) => ErrorCode::WrongChecksum,
            Error::CollectionNotFound(_) => ErrorCode::DataSourceNotFound,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether a failed attempt with this error should bump the shard's
    /// consecutive-failure counter
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Error::ShuttingDown | Error::PlanChanged(_) | Error::AttemptTimeout | Error::Requeued
        )
    }

    /// Check if the request never reached the remote side
    pub fn is_connect_failure(&self) -> bool {
        matches!(self.code(), ErrorCode::CouldNotConnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert!(!Error::ShuttingDown.counts_as_failure());
        assert!(!Error::AttemptTimeout.counts_as_failure());
        assert!(!Error::Requeued.counts_as_failure());
        assert!(!Error::PlanChanged("already done".into()).counts_as_failure());
        assert!(Error::ChecksumMismatch("100 vs 90".into()).counts_as_failure());
        assert!(Error::rpc(ErrorCode::Internal, "boom").counts_as_failure());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::AttemptTimeout.code(), ErrorCode::AttemptTimeoutExceeded);
        assert_eq!(
            Error::rpc(ErrorCode::WrongChecksum, "x").code(),
            ErrorCode::WrongChecksum
        );
        let refused = Error::ConnectionFailed {
            address: "leader:8529".into(),
            reason: "refused".into(),
        };
        assert!(refused.is_connect_failure());
        assert!(!Error::ConnectionTimeout("leader:8529".into()).is_connect_failure());
    }
}
