//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐  │
//! │  │  Configuration  │  │     Local       │  │     Remote              │  │
//! │  │                 │  │                 │  │                         │  │
//! │  │  InvalidConfig  │  │  LocalPersist.  │  │  Network   (transient)  │  │
//! │  │  MissingDeviceId│  │  (DbError)      │  │  Timeout   (transient)  │  │
//! │  │  InvalidUrl     │  │                 │  │  Rejected  (drop entry) │  │
//! │  │  ConfigLoad/Save│  │                 │  │  Unauthorized (fatal)   │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘  │
//! │                                                                         │
//! │  Engine: NotSignedIn, Unreachable, Internal                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use ironlog_db::DbError;

use crate::remote::RemoteError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid remote endpoint URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// The local store failed; nothing of the failed operation was written.
    #[error("Local persistence failed: {0}")]
    LocalPersistence(#[from] DbError),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote could not be reached or dropped the request.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call did not complete within the request timeout.
    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    /// The remote refused the request; retrying will not help.
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// The remote no longer accepts our credentials.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// No owner is signed in.
    #[error("No user signed in")]
    NotSignedIn,

    /// The connectivity monitor reports the remote unreachable.
    #[error("Remote unreachable")]
    Unreachable,

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error categories as surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// A local write or sync bookkeeping write failed and was rolled back.
    LocalPersistence,
    /// Retried with backoff; the entry stays queued.
    NetworkTransient,
    /// Non-retryable; the entry is dropped and surfaced.
    RemoteRejection,
    /// Bad settings; sync cannot start.
    Configuration,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => SyncError::Network(msg),
            RemoteError::Timeout(after) => SyncError::Timeout(after.as_millis() as u64),
            RemoteError::Rejected(msg) => SyncError::Rejected(msg),
            RemoteError::NotFound(what) => SyncError::Rejected(format!("not found: {}", what)),
            RemoteError::Unauthorized(msg) => SyncError::Unauthorized(msg),
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<ironlog_core::CoreError> for SyncError {
    fn from(err: ironlog_core::CoreError) -> Self {
        SyncError::LocalPersistence(DbError::from(err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the failed operation should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }

    /// Returns true if the remote refused a single mutation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Rejected(_))
    }

    /// Returns true if the error ends the current sync run.
    ///
    /// Fatal errors never leave cursors or acks half-written: both are
    /// committed in the same transaction as the data they describe.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_rejection()
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Maps the error onto the user-facing categories.
    pub fn kind(&self) -> SyncErrorKind {
        if self.is_config_error() {
            SyncErrorKind::Configuration
        } else if self.is_retryable() || matches!(self, SyncError::Unreachable) {
            SyncErrorKind::NetworkTransient
        } else if matches!(self, SyncError::LocalPersistence(_) | SyncError::Internal(_)) {
            SyncErrorKind::LocalPersistence
        } else {
            SyncErrorKind::RemoteRejection
        }
    }
}
