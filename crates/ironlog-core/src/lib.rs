//! # ironlog-core: Sync Domain Logic for IronLog
//!
//! Pure types and decisions shared by the local store and the sync engine.
//!
//! ## Design Principles
//! 1. **No I/O**: database, network and clock access are FORBIDDEN here
//! 2. **Closed table set**: every synced table is an [`EntityTable`] variant
//!    with a descriptor, so ordering and translation logic is written once
//! 3. **Decisions, not effects**: coalescing and conflict resolution return a
//!    plan that the storage layer executes inside a transaction
//!
//! ## Example Usage
//!
//! ```rust
//! use ironlog_core::{plan_enqueue, EnqueuePlan, MutationOp};
//!
//! // Nothing pending for this record yet: the mutation is appended.
//! assert_eq!(plan_enqueue(&[], MutationOp::Create, None), EnqueuePlan::Append);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod queue;
pub mod record;
pub mod status;
pub mod table;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{decide, LocalView, PullDecision};
pub use error::{CoreError, CoreResult};
pub use queue::{plan_enqueue, EnqueuePlan, MutationOp, QueueEntry, SentEntry};
pub use record::{
    merge_payload, new_local_id, next_updated_at, parse_payload, reference, EntityRecord,
    Payload, RemoteRecord,
};
pub use status::{NoticeKind, SyncNotice, SyncState, SyncStatus};
pub use table::{EntityTable, ForeignKey};
