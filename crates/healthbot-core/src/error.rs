//! Error taxonomy for the decision core.

use healthbot_state::{DefectId, StorageError};

/// Health bot errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid event template: {0}")]
    InvalidTemplate(String),

    #[error("defect {0} is already resolved")]
    DefectAlreadyResolved(DefectId),

    #[error("defect not found: {0}")]
    DefectNotFound(DefectId),

    #[error("defect {0} is not flagged broken")]
    DefectNotBroken(DefectId),

    #[error("notification failed for {address}: {reason}")]
    Notification { address: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for health bot operations.
pub type Result<T> = std::result::Result<T, HealthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_converts() {
        let err: HealthError = StorageError::DefectNotFound { id: 4 }.into();
        assert!(matches!(err, HealthError::Storage(_)));
        assert_eq!(err.to_string(), "storage error: Defect not found: 4");
    }

    #[test]
    fn test_notification_display() {
        let err = HealthError::Notification {
            address: "dev@list".into(),
            reason: "smtp down".into(),
        };
        assert_eq!(err.to_string(), "notification failed for dev@list: smtp down");
    }
}
