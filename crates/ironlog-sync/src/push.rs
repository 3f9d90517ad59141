//! # Push Pipeline
//!
//! Drains the mutation queue against the remote.
//!
//! ## Push Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Push Pass                                       │
//! │                                                                         │
//! │  1. peek_batch(batch_size)             oldest entries, not removed      │
//! │                                                                         │
//! │  2. order                                                               │
//! │     creates/updates   schema → day → exercise → … → set_log             │
//! │     deletes           set_log → … → schema   (after everything else)    │
//! │                                                                         │
//! │  3. per entry                                                           │
//! │     translate references local → remote                                 │
//! │       parent unbound → defer (counted only if no create is pending      │
//! │                        for the parent; orphan after max_deferrals)      │
//! │     send (under request timeout)                                        │
//! │     ┌──────────────── one transaction ────────────────┐                 │
//! │     │ bind / unbind, ack(revision), adopt updated_at  │                 │
//! │     └─────────────────────────────────────────────────┘                 │
//! │                                                                         │
//! │  4. failure                                                             │
//! │     transient  → attempts += 1, entry stays, its chain is skipped       │
//! │     rejected   → entry dropped, notice raised                           │
//! │     fatal      → run ends (auth lost, local store failure)              │
//! │                                                                         │
//! │  Passes repeat until the queue is empty, a pass makes no progress, a    │
//! │  transient failure occurs, or max_push_passes is reached.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use ironlog_core::{
    reference, EntityTable, MutationOp, NoticeKind, Payload, QueueEntry, SyncNotice,
};
use ironlog_db::repository::{identity, queue, records};
use ironlog_db::{now_millis, Database, DbError};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{with_timeout, RemoteBackend, RemoteError};

// =============================================================================
// Settings & Report
// =============================================================================

/// Tuning knobs for one push.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub batch_size: u32,
    pub max_passes: u32,
    pub max_deferrals: i64,
    pub request_timeout: Duration,
}

impl From<&SyncConfig> for PushSettings {
    fn from(config: &SyncConfig) -> Self {
        PushSettings {
            batch_size: config.sync.batch_size,
            max_passes: config.sync.max_push_passes,
            max_deferrals: config.sync.max_deferrals,
            request_timeout: config.remote.request_timeout(),
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        PushSettings::from(&SyncConfig::default())
    }
}

/// What a push did.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Passes started.
    pub passes: u32,
    /// Entries sent or resolved.
    pub attempted: usize,
    /// Entries acknowledged (including deletes that needed no remote call).
    pub acked: usize,
    /// Entries held back for an unresolved parent.
    pub deferred: usize,
    /// Entries dropped as rejected or orphaned.
    pub dropped: usize,
    /// Entries that failed transiently and stay queued.
    pub transient_failures: usize,
    /// Message of the most recent transient failure.
    pub last_transient_error: Option<String>,
    /// Rejections and orphans raised during the push.
    pub notices: Vec<SyncNotice>,
}

impl PushReport {
    /// Returns true if a retry should be scheduled.
    pub fn has_transient_failures(&self) -> bool {
        self.transient_failures > 0
    }
}

// =============================================================================
// Internals
// =============================================================================

/// Result of sending one entry.
enum Step {
    Acked,
    Deferred { parent: EntityTable, parent_local_id: String },
}

/// Outgoing payload after reference translation.
enum Outgoing {
    Ready(Payload),
    Unresolved { parent: EntityTable, local_id: String },
}

/// Tables held back for the rest of a pass after a transient failure.
#[derive(Default)]
struct Blocked {
    /// Roots of failed creates/updates; their dependents wait.
    forward: Vec<EntityTable>,
    /// Tables of failed deletes; their parents wait.
    reverse: Vec<EntityTable>,
}

impl Blocked {
    fn blocks(&self, entry: &QueueEntry) -> bool {
        if entry.op == MutationOp::Delete {
            self.reverse.iter().any(|child| child.in_chain_of(entry.table))
        } else {
            self.forward.iter().any(|root| entry.table.in_chain_of(*root))
        }
    }

    fn add(&mut self, entry: &QueueEntry) {
        if entry.op == MutationOp::Delete {
            self.reverse.push(entry.table);
        } else {
            self.forward.push(entry.table);
        }
    }
}

/// Orders a batch: creates/updates parents first, then deletes children
/// first. Queue order is kept within each table.
fn order_batch(mut entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    entries.sort_by_key(|entry| {
        let rank = entry.table.rank() as i64;
        match entry.op {
            MutationOp::Delete => (1, -rank, entry.id),
            _ => (0, rank, entry.id),
        }
    });
    entries
}

fn notice(kind: NoticeKind, entry: &QueueEntry, message: String) -> SyncNotice {
    SyncNotice {
        kind,
        table: entry.table,
        local_id: entry.local_id.clone(),
        message,
        at: now_millis(),
    }
}

// =============================================================================
// Push Pipeline
// =============================================================================

/// Sends queued mutations to the remote.
pub struct PushPipeline {
    db: Database,
    remote: Arc<dyn RemoteBackend>,
    settings: PushSettings,
}

impl PushPipeline {
    /// Creates a new push pipeline.
    pub fn new(db: Database, remote: Arc<dyn RemoteBackend>, settings: PushSettings) -> Self {
        PushPipeline {
            db,
            remote,
            settings,
        }
    }

    /// Pushes until the queue is drained or no further progress is possible.
    ///
    /// `report` is filled in as entries are processed, so it stays accurate
    /// when a fatal error ends the push early.
    pub async fn run(&self, owner: &str, report: &mut PushReport) -> SyncResult<()> {
        let queue = self.db.queue();

        while report.passes < self.settings.max_passes {
            let batch = queue.peek_batch(self.settings.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            report.passes += 1;
            info!(pass = report.passes, count = batch.len(), "Processing push batch");

            let before = (report.acked, report.dropped);
            let transient_before = report.transient_failures;

            self.process_batch(owner, batch, report).await?;

            if report.transient_failures > transient_before {
                debug!("Transient failure in pass, deferring the rest to the next run");
                break;
            }
            if (report.acked, report.dropped) == before {
                debug!("Push pass made no progress");
                break;
            }
        }

        Ok(())
    }

    async fn process_batch(
        &self,
        owner: &str,
        batch: Vec<QueueEntry>,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let mut blocked = Blocked::default();

        for entry in order_batch(batch) {
            if blocked.blocks(&entry) {
                debug!(id = entry.id, table = %entry.table, "Skipping entry behind failed chain");
                continue;
            }

            report.attempted += 1;
            match self.push_entry(owner, &entry).await {
                Ok(Step::Acked) => {
                    report.acked += 1;
                }
                Ok(Step::Deferred {
                    parent,
                    parent_local_id,
                }) => {
                    self.defer(&entry, parent, &parent_local_id, report).await?;
                }
                Err(e) if e.is_retryable() => {
                    debug!(id = entry.id, error = %e, "Transient push failure");
                    self.db.queue().record_failure(entry.id, &e.to_string()).await?;
                    report.transient_failures += 1;
                    report.last_transient_error = Some(e.to_string());
                    blocked.add(&entry);
                }
                Err(e) if e.is_rejection() => {
                    warn!(
                        id = entry.id,
                        table = %entry.table,
                        local_id = %entry.local_id,
                        op = %entry.op,
                        error = %e,
                        "Remote rejected mutation, dropping it"
                    );
                    self.db.queue().remove(entry.id).await?;
                    report.dropped += 1;
                    report
                        .notices
                        .push(notice(NoticeKind::Rejected, &entry, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Holds an entry back for an unresolved parent, dropping it once it has
    /// waited too long for a parent that nothing will ever create.
    async fn defer(
        &self,
        entry: &QueueEntry,
        parent: EntityTable,
        parent_local_id: &str,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let queue = self.db.queue();

        if queue.has_pending_create(parent, parent_local_id).await? {
            debug!(id = entry.id, %parent, parent_local_id, "Parent create still pending");
            report.deferred += 1;
            return Ok(());
        }

        let reason = format!("{} {} has no remote id", parent, parent_local_id);
        let deferrals = queue.record_deferral(entry.id, &reason).await?;

        if deferrals >= self.settings.max_deferrals {
            warn!(
                id = entry.id,
                table = %entry.table,
                local_id = %entry.local_id,
                %parent,
                parent_local_id,
                deferrals,
                "Dropping orphaned mutation"
            );
            queue.remove(entry.id).await?;
            report.dropped += 1;
            report.notices.push(notice(NoticeKind::Orphaned, entry, reason));
        } else {
            debug!(id = entry.id, deferrals, "Deferred entry with unresolved parent");
            report.deferred += 1;
        }

        Ok(())
    }

    async fn push_entry(&self, owner: &str, entry: &QueueEntry) -> SyncResult<Step> {
        let remote_id =
            identity::resolve_remote(self.db.pool(), entry.table, &entry.local_id).await?;

        match (entry.op, remote_id) {
            (MutationOp::Create, None) => self.push_create(owner, entry).await,
            // Bound already: a previous ack of this create was lost.
            (MutationOp::Create, Some(remote_id)) | (MutationOp::Update, Some(remote_id)) => {
                self.push_update(entry, &remote_id).await
            }
            (MutationOp::Update, None) => Err(SyncError::Rejected(format!(
                "{} {} was never created remotely",
                entry.table, entry.local_id
            ))),
            (MutationOp::Delete, Some(remote_id)) => self.push_delete(entry, &remote_id).await,
            (MutationOp::Delete, None) => {
                debug!(id = entry.id, "Delete of never-pushed record, dropping entry");
                queue::remove(self.db.pool(), entry.id).await?;
                Ok(Step::Acked)
            }
        }
    }

    async fn push_create(&self, owner: &str, entry: &QueueEntry) -> SyncResult<Step> {
        let payload = match self.outgoing(entry).await? {
            Outgoing::Ready(payload) => payload,
            Outgoing::Unresolved { parent, local_id } => {
                return Ok(Step::Deferred {
                    parent,
                    parent_local_id: local_id,
                })
            }
        };

        let created = with_timeout(
            self.settings.request_timeout,
            self.remote.create_record(entry.table, owner, &payload),
        )
        .await?;

        let mut tx = self.db.begin().await?;
        identity::bind(&mut tx, entry.table, &entry.local_id, &created.remote_id).await?;

        if !queue::ack(&mut *tx, entry.sent()).await? {
            if queue::get(&mut *tx, entry.id).await?.is_some() {
                // Edited in flight: the rest goes out as an update.
                queue::convert_to_update(&mut *tx, entry.id).await?;
            } else if records::fetch_row(&mut *tx, entry.table, &entry.local_id)
                .await?
                .is_none()
            {
                info!(
                    table = %entry.table,
                    local_id = %entry.local_id,
                    remote_id = %created.remote_id,
                    "Record deleted while its create was in flight, queueing remote delete"
                );
                queue::enqueue(
                    &mut tx,
                    entry.table,
                    MutationOp::Delete,
                    &entry.local_id,
                    None,
                    now_millis(),
                )
                .await?;
            }
        }

        records::adopt_remote_timestamp(
            &mut tx,
            entry.table,
            &entry.local_id,
            entry.base_updated_at,
            created.updated_at,
        )
        .await?;
        tx.commit().await.map_err(DbError::from)?;

        debug!(
            table = %entry.table,
            local_id = %entry.local_id,
            remote_id = %created.remote_id,
            "Create acknowledged"
        );
        Ok(Step::Acked)
    }

    async fn push_update(&self, entry: &QueueEntry, remote_id: &str) -> SyncResult<Step> {
        let payload = match self.outgoing(entry).await? {
            Outgoing::Ready(payload) => payload,
            Outgoing::Unresolved { parent, local_id } => {
                return Ok(Step::Deferred {
                    parent,
                    parent_local_id: local_id,
                })
            }
        };

        let updated_at = with_timeout(
            self.settings.request_timeout,
            self.remote.update_record(entry.table, remote_id, &payload),
        )
        .await?;

        let mut tx = self.db.begin().await?;
        let acked = queue::ack(&mut *tx, entry.sent()).await?;
        records::adopt_remote_timestamp(
            &mut tx,
            entry.table,
            &entry.local_id,
            entry.base_updated_at,
            updated_at,
        )
        .await?;
        tx.commit().await.map_err(DbError::from)?;

        debug!(table = %entry.table, remote_id, acked, "Update acknowledged");
        Ok(Step::Acked)
    }

    async fn push_delete(&self, entry: &QueueEntry, remote_id: &str) -> SyncResult<Step> {
        match with_timeout(
            self.settings.request_timeout,
            self.remote.delete_record(entry.table, remote_id),
        )
        .await
        {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => {
                debug!(table = %entry.table, remote_id, "Already deleted remotely");
            }
            Err(e) => return Err(e.into()),
        }

        let mut tx = self.db.begin().await?;
        queue::ack(&mut *tx, entry.sent()).await?;
        identity::unbind(&mut *tx, entry.table, &entry.local_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        debug!(table = %entry.table, remote_id, "Delete acknowledged");
        Ok(Step::Acked)
    }

    /// Translates the entry's reference fields to remote ids.
    async fn outgoing(&self, entry: &QueueEntry) -> SyncResult<Outgoing> {
        let mut payload = entry.payload.clone().unwrap_or_default();

        for key in entry.table.foreign_keys() {
            let Some(parent_local_id) = reference(&payload, key.field)? else {
                continue;
            };

            match identity::resolve_remote(self.db.pool(), key.parent, &parent_local_id).await? {
                Some(remote_id) => {
                    payload.insert(key.field.to_string(), Value::String(remote_id));
                }
                None => {
                    return Ok(Outgoing::Unresolved {
                        parent: key.parent,
                        local_id: parent_local_id,
                    })
                }
            }
        }

        Ok(Outgoing::Ready(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryRemote, RemoteCall};
    use ironlog_db::DbConfig;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> (Database, Arc<InMemoryRemote>, PushPipeline) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let push = PushPipeline::new(db.clone(), remote.clone(), PushSettings::default());
        (db, remote, push)
    }

    fn entry(id: i64, table: EntityTable, op: MutationOp) -> QueueEntry {
        QueueEntry {
            id,
            table,
            op,
            local_id: format!("L{}", id),
            payload: None,
            enqueued_at: 0,
            base_updated_at: 0,
            revision: 0,
            attempts: 0,
            deferrals: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_batch_order() {
        let batch = vec![
            entry(1, EntityTable::SetLog, MutationOp::Delete),
            entry(2, EntityTable::Exercise, MutationOp::Create),
            entry(3, EntityTable::Schema, MutationOp::Delete),
            entry(4, EntityTable::Day, MutationOp::Create),
            entry(5, EntityTable::Schema, MutationOp::Update),
        ];

        let ids: Vec<i64> = order_batch(batch).iter().map(|e| e.id).collect();
        assert_eq!(ids, [5, 4, 2, 1, 3]);
    }

    #[test]
    fn test_blocked_chain() {
        let mut blocked = Blocked::default();
        blocked.add(&entry(1, EntityTable::Day, MutationOp::Create));

        assert!(blocked.blocks(&entry(2, EntityTable::Exercise, MutationOp::Create)));
        assert!(blocked.blocks(&entry(3, EntityTable::Day, MutationOp::Update)));
        assert!(!blocked.blocks(&entry(4, EntityTable::Schema, MutationOp::Create)));
        assert!(!blocked.blocks(&entry(5, EntityTable::Exercise, MutationOp::Delete)));

        blocked.add(&entry(6, EntityTable::Exercise, MutationOp::Delete));
        assert!(blocked.blocks(&entry(7, EntityTable::Day, MutationOp::Delete)));
        assert!(!blocked.blocks(&entry(8, EntityTable::SetLog, MutationOp::Delete)));
    }

    #[tokio::test]
    async fn test_parent_is_created_before_child() {
        let (db, remote, push) = setup().await;
        let schema = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        let day = db
            .records()
            .create(
                EntityTable::Day,
                payload(json!({ "name": "Push", "schemaId": schema.local_id })),
            )
            .await
            .unwrap();

        let mut report = PushReport::default();
        push.run("user-1", &mut report).await.unwrap();

        assert_eq!(report.acked, 2);
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);

        let schema_remote = db.identity().resolve_remote(EntityTable::Schema, &schema.local_id).await.unwrap().unwrap();
        let day_remote = db.identity().resolve_remote(EntityTable::Day, &day.local_id).await.unwrap().unwrap();
        let stored = remote.get(EntityTable::Day, &day_remote).await.unwrap();
        assert_eq!(stored.payload["schemaId"], json!(schema_remote));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_entry_and_blocks_chain() {
        let (db, remote, push) = setup().await;
        let schema = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        db.records()
            .create(EntityTable::Day, payload(json!({ "schemaId": schema.local_id })))
            .await
            .unwrap();

        remote.fail_next(RemoteError::Timeout(Duration::from_secs(1))).await;

        let mut report = PushReport::default();
        push.run("user-1", &mut report).await.unwrap();

        assert_eq!(report.transient_failures, 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(remote.mutation_count().await, 1);

        let pending = db.queue().peek_batch(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_rejection_drops_entry_with_notice() {
        let (db, remote, push) = setup().await;
        db.records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        let other = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "5x5" })))
            .await
            .unwrap();

        remote.fail_next(RemoteError::Rejected("name taken".into())).await;

        let mut report = PushReport::default();
        push.run("user-1", &mut report).await.unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(report.notices.len(), 1);
        assert_eq!(report.notices[0].kind, NoticeKind::Rejected);
        assert!(db.identity().resolve_remote(EntityTable::Schema, &other.local_id).await.unwrap().is_some());
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let (db, remote, push) = setup().await;
        db.records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();

        remote.fail_next(RemoteError::Unauthorized("expired".into())).await;

        let mut report = PushReport::default();
        let err = push.run("user-1", &mut report).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert_eq!(db.queue().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphan_is_dropped_after_max_deferrals() {
        let (db, remote, push) = setup().await;
        // Parent exists locally but was never queued for push.
        db.queue()
            .enqueue(
                EntityTable::Day,
                MutationOp::Create,
                "D1",
                Some(&payload(json!({ "schemaId": "S-missing" }))),
                1,
            )
            .await
            .unwrap();

        let max = PushSettings::default().max_deferrals;
        let mut last = PushReport::default();
        for _ in 0..max {
            last = PushReport::default();
            push.run("user-1", &mut last).await.unwrap();
        }

        assert_eq!(last.dropped, 1);
        assert_eq!(last.notices[0].kind, NoticeKind::Orphaned);
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
        assert_eq!(remote.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_success() {
        let (db, remote, push) = setup().await;
        let schema = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        let mut report = PushReport::default();
        push.run("user-1", &mut report).await.unwrap();

        let remote_id = db.identity().resolve_remote(EntityTable::Schema, &schema.local_id).await.unwrap().unwrap();
        remote.purge_external(EntityTable::Schema, &remote_id).await;
        db.records().delete(EntityTable::Schema, &schema.local_id).await.unwrap();

        let mut report = PushReport::default();
        push.run("user-1", &mut report).await.unwrap();

        assert_eq!(report.acked, 1);
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
        assert!(db.identity().resolve_remote(EntityTable::Schema, &schema.local_id).await.unwrap().is_none());
        assert!(remote
            .calls()
            .await
            .contains(&RemoteCall::Delete { table: EntityTable::Schema, remote_id }));
    }
}
