//! # Sync Status
//!
//! Process-wide sync status read by the UI layer. The sync engine is the
//! only writer.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::table::EntityTable;

/// Sync engine state machine: `idle → syncing → (idle | error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Error => write!(f, "error"),
        }
    }
}

/// Why a notice was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A pending local edit lost to a newer remote write.
    ConflictDropped,
    /// The remote refused a mutation; it will not be retried.
    Rejected,
    /// A child mutation whose parent never resolved was dropped.
    Orphaned,
    /// A pulled record could not be read and was skipped.
    Malformed,
}

/// A non-blocking message for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotice {
    pub kind: NoticeKind,
    pub table: EntityTable,
    pub local_id: String,
    pub message: String,
    /// Milliseconds since epoch.
    pub at: i64,
}

/// Snapshot of the engine's status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Last run that finished without a fatal error (ms).
    pub last_sync_at: Option<i64>,
    /// Unacked mutation queue entries.
    pub pending_count: i64,
    pub last_error: Option<String>,
    /// Conflicts and rejections raised by the most recent run.
    pub notices: Vec<SyncNotice>,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.state == SyncState::Syncing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default_is_idle() {
        let status = SyncStatus::default();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_none());
        assert!(status.notices.is_empty());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let json = serde_json::to_value(SyncStatus::default()).unwrap();
        assert!(json.get("pendingCount").is_some());
        assert_eq!(json["state"], "idle");
    }
}
