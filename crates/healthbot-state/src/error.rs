//! Error types for healthbot-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Generic record lookup failure
    #[error("Record not found: {key}")]
    NotFound { key: String },

    /// Defect id does not exist in the store
    #[error("Defect not found: {id}")]
    DefectNotFound { id: u64 },

    /// Record violates a structural rule (bad id, illegal status, ...)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Backend I/O or transport failure
    #[error("Storage backend failed: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
