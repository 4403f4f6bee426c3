//! Error types for the metadata store.

use thiserror::Error;

/// Result type alias for metadata store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur during metadata store operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lease {0} not found")]
    LeaseNotFound(u64),

    #[error("atomic operation \"{op}\" failed: too many conflicts after {attempts} attempts")]
    RetriesExhausted { op: String, attempts: usize },

    #[error("atomic operation \"{op}\" failed: deadline exceeded")]
    DeadlineExceeded { op: String },
}
