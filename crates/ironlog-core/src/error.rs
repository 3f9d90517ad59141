//! # Error Types
//!
//! Domain-specific error types for ironlog-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ironlog-core   CoreError  - malformed tables, operations, payloads     │
//! │  ironlog-db     DbError    - storage failures, identity conflicts       │
//! │  ironlog-sync   SyncError  - push/pull failures, classified for retry   │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → SyncStatus.last_error          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Errors raised by the pure sync domain logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored or received table name is not one of the synced tables.
    #[error("Unknown entity table: {0}")]
    UnknownTable(String),

    /// A stored queue operation is not create/update/delete.
    #[error("Unknown mutation operation: {0}")]
    UnknownOperation(String),

    /// A payload is not a JSON object or holds a malformed field.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidPayload(err.to_string())
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CoreError::UnknownTable("workouts".into()).to_string(),
            "Unknown entity table: workouts"
        );
    }

    #[test]
    fn test_json_errors_become_invalid_payload() {
        let err: CoreError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidPayload(_)));
    }
}
