//! # Conflict Resolution
//!
//! Whole-record, timestamp-based last-writer-wins, applied on pull.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  incoming.updated_at > local.updated_at ?                               │
//! │      no  → ignore (already applied, or a local edit is newer)           │
//! │      yes → overwrite the whole row                                      │
//! │            └─ pending local mutation? drop it and surface a conflict    │
//! │                                                                         │
//! │  tombstone → delete the row and unbind                                  │
//! │            └─ pending local mutation? drop it and surface a conflict    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// What the local side knows about a record that the remote has listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalView {
    /// `updated_at` of the local row, or of the pending delete when the row
    /// is already gone locally.
    pub updated_at: i64,
    /// Whether unacked queue entries exist for the record.
    pub has_pending: bool,
}

/// Outcome of comparing one pulled record against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// Unknown remote id: insert a new row and bind it.
    Insert,
    /// Remote is strictly newer: replace the row.
    Overwrite,
    /// Remote is strictly newer than a pending local edit: replace the row
    /// and drop the pending entries.
    OverwriteDroppingPending,
    /// Remote is not newer: keep local.
    Ignore,
    /// Tombstone for a known record.
    Delete,
    /// Tombstone for a record with pending local edits.
    DeleteDroppingPending,
}

impl PullDecision {
    /// Returns true if the decision discards local work.
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            PullDecision::OverwriteDroppingPending | PullDecision::DeleteDroppingPending
        )
    }
}

/// Decides how to apply a pulled record.
///
/// `local` is `None` when the remote id has no identity-map binding.
pub fn decide(incoming_updated_at: i64, deleted: bool, local: Option<LocalView>) -> PullDecision {
    let Some(local) = local else {
        return if deleted {
            PullDecision::Ignore
        } else {
            PullDecision::Insert
        };
    };

    if deleted {
        return if local.has_pending {
            PullDecision::DeleteDroppingPending
        } else {
            PullDecision::Delete
        };
    }

    if incoming_updated_at <= local.updated_at {
        return PullDecision::Ignore;
    }

    if local.has_pending {
        PullDecision::OverwriteDroppingPending
    } else {
        PullDecision::Overwrite
    }
}
