//! # Sync Events
//!
//! Push-style notifications for UI bridges. Pull-style observers use
//! [`SyncEngine::subscribe`](crate::SyncEngine::subscribe) instead.

use tracing::{info, warn};

use ironlog_core::{NoticeKind, SyncNotice, SyncStatus};

/// Receives status changes and notices from the engine.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a conflict, rejection or orphan notice.
    fn emit_notice(&self, notice: &SyncNotice);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_notice(&self, _notice: &SyncNotice) {}
}

/// Writes events to the tracing log.
pub struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_status(&self, status: &SyncStatus) {
        info!(
            state = %status.state,
            pending = status.pending_count,
            last_sync_at = ?status.last_sync_at,
            error = ?status.last_error,
            "sync://status"
        );
    }

    fn emit_notice(&self, notice: &SyncNotice) {
        match notice.kind {
            NoticeKind::ConflictDropped => info!(
                table = %notice.table,
                local_id = %notice.local_id,
                "sync://conflict {}", notice.message
            ),
            NoticeKind::Rejected | NoticeKind::Orphaned | NoticeKind::Malformed => warn!(
                table = %notice.table,
                local_id = %notice.local_id,
                kind = ?notice.kind,
                "sync://rejected {}", notice.message
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event for assertions.
    #[derive(Default)]
    pub struct RecordingEmitter {
        pub statuses: Mutex<Vec<SyncStatus>>,
        pub notices: Mutex<Vec<SyncNotice>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, status: &SyncStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn emit_notice(&self, notice: &SyncNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }
}
