//! # Repository Module
//!
//! Local store repositories.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Each module has two layers:                                            │
//! │                                                                         │
//! │  free functions   generic over the executor, so the sync engine can     │
//! │                   compose them inside one transaction (&mut *tx)        │
//! │                                                                         │
//! │  XxxRepository    owns a pool clone; one-off calls from the app and     │
//! │                   the engine's bookkeeping                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`](records::RecordRepository) - Entity rows and the local write API
//! - [`MutationQueueRepository`](queue::MutationQueueRepository) - Pending writes
//! - [`IdentityRepository`](identity::IdentityRepository) - Local ⇄ remote ids
//! - [`SyncCursorRepository`](cursor::SyncCursorRepository) - Pull cursors and markers

pub mod cursor;
pub mod identity;
pub mod queue;
pub mod records;
