//! # ironlog-sync: Sync Engine for IronLog
//!
//! Keeps the local store and the remote authority converging: drains the
//! mutation queue, maintains the identity map, pulls remote deltas, resolves
//! conflicts and reports status.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  Triggers: sign-in, foreground, connectivity restored, manual, retry    │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                  SyncEngine (Main Orchestrator)                  │   │
//! │  │  one run at a time, concurrent requests coalesced                │   │
//! │  │  status (watch) + SyncEventEmitter                               │   │
//! │  └────────────────────────────┬─────────────────────────────────────┘   │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                   │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐     │
//! │  │ PushPipeline   │  │ RemoteBackend  │  │  PullPipeline          │     │
//! │  │                │  │                │  │                        │     │
//! │  │ mutation queue │  │ list / create  │  │ per-table cursors      │     │
//! │  │ parent-first   │  │ update/delete  │  │ last-writer-wins       │     │
//! │  │ identity bind  │  │ (trait)        │  │ tombstones             │     │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘     │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐                                 │
//! │  │ Connectivity   │  │ SyncConfig     │                                 │
//! │  │ watch flag +   │  │ TOML + env     │                                 │
//! │  │ TCP probe      │  │ overrides      │                                 │
//! │  └────────────────┘  └────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - Main `SyncEngine` orchestrator
//! - [`push`] - Mutation queue upload
//! - [`pull`] - Remote delta application and conflict handling
//! - [`remote`] - `RemoteBackend` trait
//! - [`memory`] - In-memory remote for tests and simulation
//! - [`connectivity`] - Reachability flag, probe and reconnect trigger
//! - [`config`] - Sync configuration (mode, device, remote, database)
//! - [`events`] - Event emitter seam for UI bridges
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ironlog_sync::{SyncConfig, SyncEngineBuilder};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = SyncEngineBuilder::new(config)
//!     .with_database(db)
//!     .with_remote(remote)
//!     .build()?;
//!
//! engine.on_auth_changed(Some(user_id)).await?;
//! let mut status = engine.subscribe();
//! while status.changed().await.is_ok() {
//!     println!("{}", status.borrow().state);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod pull;
pub mod push;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{SyncConfig, SyncMode};
pub use connectivity::{
    spawn_probe_loop, spawn_reconnect_trigger, Connectivity, ReachabilityProbe, TcpProbe,
};
pub use engine::{RunKind, RunOutcome, SyncEngine, SyncEngineBuilder, SyncReport, Trigger};
pub use error::{SyncError, SyncErrorKind, SyncResult};
pub use events::{LogEmitter, NoOpEmitter, SyncEventEmitter};
pub use memory::{InMemoryRemote, RemoteCall};
pub use pull::{PullMode, PullReport};
pub use push::{PushReport, PushSettings};
pub use remote::{CreatedRecord, RemoteBackend, RemoteError, RemoteResult};

pub use ironlog_core::{NoticeKind, SyncNotice, SyncState, SyncStatus};
