//! # ironlog-db: Local Store for IronLog
//!
//! SQLite persistence for the workout entities and the sync bookkeeping
//! around them, using sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  App (UI)                         ironlog-sync (push / pull)            │
//! │     │  records().create(...)           │  queue / identity / cursors    │
//! │     ▼                                  ▼                                │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    ironlog-db (THIS CRATE)                      │    │
//! │  │                                                                 │    │
//! │  │   Database (pool.rs)   Repositories            Migrations       │    │
//! │  │   SqlitePool, WAL      records  queue          001 entities     │    │
//! │  │                        identity cursor         002 sync tables  │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  SQLite file (or :memory: in tests)                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ironlog_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("ironlog.db")).await?;
//! let schema = db.records().create(EntityTable::Schema, payload).await?;
//! assert_eq!(db.queue().count_pending().await?, 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cursor::SyncCursorRepository;
pub use repository::identity::IdentityRepository;
pub use repository::queue::{EnqueueOutcome, MutationQueueRepository};
pub use repository::records::{RecordRepository, StoredRow};

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
