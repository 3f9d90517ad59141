//! # Mutation Queue Types
//!
//! Queue entries and the coalescing rule applied at enqueue time.
//!
//! ## Coalescing Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Pending for local_id        Incoming     Result                        │
//! │  ─────────────────────       ────────     ───────────────────────────   │
//! │  (nothing)                   any          append                        │
//! │  create                      update       merge into the create         │
//! │  update                      update       merge into the update         │
//! │  create (+ merged edits)     delete       remove all, drop the delete   │
//! │  update                      delete       remove update, append delete  │
//! │  delete                      update       discard the update            │
//! │  delete                      delete       discard                       │
//! │                                                                         │
//! │  Merges keep the earlier entry's queue position, so records are         │
//! │  still served FIFO relative to each other.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::record::{merge_payload, Payload};
use crate::table::EntityTable;

// =============================================================================
// Mutation Operation
// =============================================================================

/// Kind of write recorded in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    /// Returns true for operations that carry a payload.
    pub fn carries_payload(self) -> bool {
        !matches!(self, MutationOp::Delete)
    }
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationOp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationOp::Create),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Queue Entry
// =============================================================================

/// A pending write waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Monotonic sequence number (queue position).
    pub id: i64,
    pub table: EntityTable,
    pub op: MutationOp,
    pub local_id: String,
    /// Full field set for create, changed fields for update.
    pub payload: Option<Payload>,
    pub enqueued_at: i64,
    /// Local `updated_at` of the edit that produced (or last merged into)
    /// this entry.
    pub base_updated_at: i64,
    /// Bumped whenever a later edit is merged in.
    pub revision: i64,
    /// Failed push attempts so far.
    pub attempts: i64,
    /// Passes this entry was held back for an unresolved parent.
    pub deferrals: i64,
    pub last_error: Option<String>,
}

/// Token identifying the exact version of an entry that was sent.
///
/// An ack removes the entry only if the revision still matches, so an edit
/// merged in while the request was in flight is not lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentEntry {
    pub id: i64,
    pub revision: i64,
}

impl QueueEntry {
    pub fn sent(&self) -> SentEntry {
        SentEntry {
            id: self.id,
            revision: self.revision,
        }
    }
}

// =============================================================================
// Coalescing
// =============================================================================

/// What the queue must do with an incoming mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueuePlan {
    /// Append a new entry.
    Append,
    /// Replace the payload of an existing entry and bump its revision.
    MergeInto { entry_id: i64, payload: Payload },
    /// Remove the superseded entries, then append the delete.
    Supersede { remove: Vec<i64> },
    /// Remove the entries and drop the delete: the record never reached
    /// the remote.
    Cancel { remove: Vec<i64> },
    /// Drop the incoming mutation.
    Discard,
}

/// Decides how to enqueue `op` given the still-pending entries for the
/// same `(table, local_id)`, oldest first.
pub fn plan_enqueue(
    pending: &[QueueEntry],
    op: MutationOp,
    payload: Option<&Payload>,
) -> EnqueuePlan {
    let has_delete = pending.iter().any(|e| e.op == MutationOp::Delete);

    match op {
        MutationOp::Create => EnqueuePlan::Append,

        MutationOp::Update => {
            if has_delete {
                return EnqueuePlan::Discard;
            }
            let target = pending
                .iter()
                .rev()
                .find(|e| matches!(e.op, MutationOp::Create | MutationOp::Update));
            match target {
                Some(entry) => {
                    let mut merged = entry.payload.clone().unwrap_or_default();
                    if let Some(patch) = payload {
                        merge_payload(&mut merged, patch);
                    }
                    EnqueuePlan::MergeInto {
                        entry_id: entry.id,
                        payload: merged,
                    }
                }
                None => EnqueuePlan::Append,
            }
        }

        MutationOp::Delete => {
            if has_delete {
                return EnqueuePlan::Discard;
            }
            let remove: Vec<i64> = pending
                .iter()
                .filter(|e| matches!(e.op, MutationOp::Create | MutationOp::Update))
                .map(|e| e.id)
                .collect();
            if pending.iter().any(|e| e.op == MutationOp::Create) {
                EnqueuePlan::Cancel { remove }
            } else if remove.is_empty() {
                EnqueuePlan::Append
            } else {
                EnqueuePlan::Supersede { remove }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn entry(id: i64, op: MutationOp, p: Option<serde_json::Value>) -> QueueEntry {
        QueueEntry {
            id,
            table: EntityTable::Schema,
            op,
            local_id: "S1".into(),
            payload: p.map(payload),
            enqueued_at: 0,
            base_updated_at: 0,
            revision: 0,
            attempts: 0,
            deferrals: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_first_mutation_appends() {
        assert_eq!(plan_enqueue(&[], MutationOp::Create, None), EnqueuePlan::Append);
        assert_eq!(plan_enqueue(&[], MutationOp::Update, None), EnqueuePlan::Append);
        assert_eq!(plan_enqueue(&[], MutationOp::Delete, None), EnqueuePlan::Append);
    }

    #[test]
    fn test_update_merges_into_pending_update() {
        let pending = [entry(4, MutationOp::Update, Some(json!({ "name": "A", "reps": 5 })))];
        let patch = payload(json!({ "reps": 8 }));
        assert_eq!(
            plan_enqueue(&pending, MutationOp::Update, Some(&patch)),
            EnqueuePlan::MergeInto {
                entry_id: 4,
                payload: payload(json!({ "name": "A", "reps": 8 })),
            }
        );
    }

    #[test]
    fn test_update_merges_into_pending_create() {
        let pending = [entry(1, MutationOp::Create, Some(json!({ "name": "A" })))];
        let patch = payload(json!({ "name": "B" }));
        let plan = plan_enqueue(&pending, MutationOp::Update, Some(&patch));
        assert_eq!(
            plan,
            EnqueuePlan::MergeInto {
                entry_id: 1,
                payload: payload(json!({ "name": "B" })),
            }
        );
    }

    #[test]
    fn test_delete_cancels_unpushed_create() {
        let pending = [entry(1, MutationOp::Create, Some(json!({})))];
        assert_eq!(
            plan_enqueue(&pending, MutationOp::Delete, None),
            EnqueuePlan::Cancel { remove: vec![1] }
        );
    }

    #[test]
    fn test_delete_supersedes_pending_update() {
        let pending = [entry(7, MutationOp::Update, Some(json!({ "reps": 3 })))];
        assert_eq!(
            plan_enqueue(&pending, MutationOp::Delete, None),
            EnqueuePlan::Supersede { remove: vec![7] }
        );
    }

    #[test]
    fn test_nothing_follows_a_pending_delete() {
        let pending = [entry(9, MutationOp::Delete, None)];
        assert_eq!(plan_enqueue(&pending, MutationOp::Update, None), EnqueuePlan::Discard);
        assert_eq!(plan_enqueue(&pending, MutationOp::Delete, None), EnqueuePlan::Discard);
    }

    #[test]
    fn test_op_round_trips_through_str() {
        for op in [MutationOp::Create, MutationOp::Update, MutationOp::Delete] {
            assert_eq!(op.as_str().parse::<MutationOp>().unwrap(), op);
        }
        assert!("upsert".parse::<MutationOp>().is_err());
    }
}
