//! # Remote Backend
//!
//! The single remote authority the engine syncs against, seen only through
//! [`RemoteBackend`]. Records are scoped to an owner and carry a per-record
//! `updated_at` that the remote advances on every write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  list_changed_since(table, owner, cursor) → [RemoteRecord]              │
//! │      updated_at > cursor, tombstones included                           │
//! │  create_record(table, owner, payload)     → { remote_id, updated_at }   │
//! │  update_record(table, remote_id, payload) → updated_at                  │
//! │  delete_record(table, remote_id)          → ()                          │
//! │                                                                         │
//! │  Payload references hold REMOTE ids on this side of the boundary.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ironlog_core::{EntityTable, Payload, RemoteRecord};

/// Errors reported by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection refused, reset, DNS failure, 5xx.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Validation failure or other permanent refusal.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The addressed record does not exist (or is already deleted).
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials missing or expired.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    /// Returns true if the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout(_))
    }
}

/// Result type alias for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Identity and version the remote assigned to a newly created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRecord {
    pub remote_id: String,
    pub updated_at: i64,
}

/// Record CRUD offered by the remote authority.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Lists records of `table` owned by `owner` with `updated_at > cursor`,
    /// oldest first.
    async fn list_changed_since(
        &self,
        table: EntityTable,
        owner: &str,
        cursor: i64,
    ) -> RemoteResult<Vec<RemoteRecord>>;

    /// Creates a record and returns its assigned id and version.
    async fn create_record(
        &self,
        table: EntityTable,
        owner: &str,
        payload: &Payload,
    ) -> RemoteResult<CreatedRecord>;

    /// Applies `payload` to an existing record and returns its new version.
    async fn update_record(
        &self,
        table: EntityTable,
        remote_id: &str,
        payload: &Payload,
    ) -> RemoteResult<i64>;

    /// Deletes a record.
    async fn delete_record(&self, table: EntityTable, remote_id: &str) -> RemoteResult<()>;
}

/// Runs a remote call under `timeout`; an elapsed timeout is a transient
/// [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!RemoteError::Rejected("schemaId required".into()).is_transient());
        assert!(!RemoteError::NotFound("r-1".into()).is_transient());
        assert!(!RemoteError::Unauthorized("expired".into()).is_transient());
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RemoteError>(1)
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(RemoteError::Timeout(Duration::from_millis(10))));

        let fast = async { Ok::<_, RemoteError>(2) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await, Ok(2));
    }
}
