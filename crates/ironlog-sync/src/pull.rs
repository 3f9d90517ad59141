//! # Pull Pipeline
//!
//! Fetches remote changes per table and merges them into the local store.
//!
//! ## Apply Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Per Pulled Record                                    │
//! │                                                                         │
//! │  malformed reference → skip, notice, cursor still advances              │
//! │  resolve_local(remote_id)                                               │
//! │     none        → new local id, translate references, insert, bind      │
//! │     found       → decide():                                             │
//! │                     incoming.updated_at <= local → skip                 │
//! │                     newer                        → overwrite row        │
//! │                       pending local entries?     → drop + notice        │
//! │  tombstone      → delete row, unbind, drop pending entries              │
//! │                                                                         │
//! │  FULL MODE (initial sync):                                              │
//! │     cursor ignored; rows bound to remote ids absent from the listing    │
//! │     and without pending entries are deleted                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tables are pulled parents first so references can be translated. A
//! table's batch and its cursor advance share one transaction; if the
//! listing or any apply fails, nothing of that table is written.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use ironlog_core::{
    decide, new_local_id, reference, EntityTable, LocalView, NoticeKind, Payload,
    PullDecision, RemoteRecord, SyncNotice,
};
use ironlog_db::repository::{cursor, identity, queue, records};
use ironlog_db::{now_millis, Database, DbError};

use crate::error::SyncResult;
use crate::remote::{with_timeout, RemoteBackend};

/// How far back a pull reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// From each table's stored cursor.
    Incremental,
    /// Everything, with absence-based deletion.
    Full,
}

/// What a pull did.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Tables whose batch was applied.
    pub tables: usize,
    /// Records listed by the remote.
    pub received: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub deleted: usize,
    /// Records that were not newer than local.
    pub ignored: usize,
    /// Records left out because their payload could not be read.
    pub skipped: usize,
    /// Conflicts raised during the pull.
    pub notices: Vec<SyncNotice>,
}

/// Applies remote changes to the local store.
pub struct PullPipeline {
    db: Database,
    remote: Arc<dyn RemoteBackend>,
    request_timeout: Duration,
}

impl PullPipeline {
    /// Creates a new pull pipeline.
    pub fn new(db: Database, remote: Arc<dyn RemoteBackend>, request_timeout: Duration) -> Self {
        PullPipeline {
            db,
            remote,
            request_timeout,
        }
    }

    /// Pulls every table in dependency order. Stops at the first failure;
    /// tables already applied keep their progress.
    pub async fn run(&self, owner: &str, mode: PullMode, report: &mut PullReport) -> SyncResult<()> {
        for table in EntityTable::ALL {
            self.pull_table(owner, table, mode, report).await?;
        }
        Ok(())
    }

    async fn pull_table(
        &self,
        owner: &str,
        table: EntityTable,
        mode: PullMode,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let cursor = match mode {
            PullMode::Incremental => self.db.cursors().get(table).await?,
            PullMode::Full => 0,
        };

        let batch = with_timeout(
            self.request_timeout,
            self.remote.list_changed_since(table, owner, cursor),
        )
        .await?;

        if batch.is_empty() && mode == PullMode::Incremental {
            debug!(%table, cursor, "No remote changes");
            report.tables += 1;
            return Ok(());
        }

        let before = (report.inserted, report.overwritten, report.deleted, report.skipped);
        let mut listed = HashSet::with_capacity(batch.len());
        let mut high_water = cursor;

        let mut tx = self.db.begin().await?;
        for record in &batch {
            listed.insert(record.remote_id.as_str());
            high_water = high_water.max(record.updated_at);
            self.apply(&mut tx, table, record, report).await?;
        }

        if mode == PullMode::Full {
            self.delete_absent(&mut tx, table, &listed, report).await?;
        }

        cursor::advance(&mut *tx, table, high_water).await?;
        tx.commit().await.map_err(DbError::from)?;

        report.tables += 1;
        report.received += batch.len();

        info!(
            %table,
            received = batch.len(),
            inserted = report.inserted - before.0,
            overwritten = report.overwritten - before.1,
            deleted = report.deleted - before.2,
            skipped = report.skipped - before.3,
            cursor = high_water,
            "Applied remote changes"
        );
        Ok(())
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        table: EntityTable,
        record: &RemoteRecord,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let local_id = identity::resolve_local(&mut *conn, table, &record.remote_id).await?;

        if !record.deleted {
            if let Some(problem) = malformed_reference(table, &record.payload) {
                warn!(%table, remote_id = %record.remote_id, %problem, "Skipping malformed pulled record");
                report.notices.push(SyncNotice {
                    kind: NoticeKind::Malformed,
                    table,
                    local_id: local_id.unwrap_or_else(|| record.remote_id.clone()),
                    message: format!("A {} from the server could not be read: {}", table, problem),
                    at: now_millis(),
                });
                report.skipped += 1;
                return Ok(());
            }
        }

        let view = match &local_id {
            Some(id) => Some(local_view(conn, table, id).await?),
            None => None,
        };

        let decision = decide(record.updated_at, record.deleted, view);
        debug!(%table, remote_id = %record.remote_id, ?decision, "Pulled record");

        match (decision, local_id) {
            (PullDecision::Insert, _) => {
                let local_id = new_local_id();
                let payload = to_local_refs(conn, table, &record.payload).await?;
                records::upsert_row(&mut *conn, table, &local_id, &payload, record.updated_at)
                    .await?;
                identity::bind(conn, table, &local_id, &record.remote_id).await?;
                report.inserted += 1;
            }
            (PullDecision::Overwrite | PullDecision::OverwriteDroppingPending, Some(local_id)) => {
                let payload = to_local_refs(conn, table, &record.payload).await?;
                records::upsert_row(&mut *conn, table, &local_id, &payload, record.updated_at)
                    .await?;

                if decision.is_conflict() {
                    let dropped = queue::remove_for_record(&mut *conn, table, &local_id).await?;
                    info!(%table, local_id = %local_id, dropped, "Remote edit won over pending local change");
                    report.notices.push(SyncNotice {
                        kind: NoticeKind::ConflictDropped,
                        table,
                        local_id,
                        message: format!(
                            "A newer version from another device replaced your unsynced change to this {}",
                            table
                        ),
                        at: now_millis(),
                    });
                }
                report.overwritten += 1;
            }
            (PullDecision::Delete | PullDecision::DeleteDroppingPending, Some(local_id)) => {
                let row_existed = records::delete_row(&mut *conn, table, &local_id).await?;
                identity::unbind(&mut *conn, table, &local_id).await?;

                if decision.is_conflict() {
                    queue::remove_for_record(&mut *conn, table, &local_id).await?;
                    // A pending local delete agrees with the tombstone.
                    if row_existed {
                        report.notices.push(SyncNotice {
                            kind: NoticeKind::ConflictDropped,
                            table,
                            local_id,
                            message: format!(
                                "This {} was deleted on another device; your unsynced change was discarded",
                                table
                            ),
                            at: now_millis(),
                        });
                    }
                }
                report.deleted += 1;
            }
            _ => {
                report.ignored += 1;
            }
        }

        Ok(())
    }

    /// Deletes bound rows the remote no longer lists at all.
    async fn delete_absent(
        &self,
        conn: &mut SqliteConnection,
        table: EntityTable,
        listed: &HashSet<&str>,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        for (local_id, remote_id) in identity::bindings(&mut *conn, table).await? {
            if listed.contains(remote_id.as_str()) {
                continue;
            }
            if !queue::pending_for(&mut *conn, table, &local_id).await?.is_empty() {
                continue;
            }

            records::delete_row(&mut *conn, table, &local_id).await?;
            identity::unbind(&mut *conn, table, &local_id).await?;
            debug!(%table, local_id = %local_id, remote_id = %remote_id, "Removed record absent from remote");
            report.deleted += 1;
        }
        Ok(())
    }
}

/// Builds the conflict view of a bound record.
///
/// A row that is gone locally is represented by the timestamp of its pending
/// delete.
async fn local_view(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
) -> SyncResult<LocalView> {
    let row = records::fetch_row(&mut *conn, table, local_id).await?;
    let pending = queue::pending_for(&mut *conn, table, local_id).await?;

    let updated_at = match &row {
        Some(row) => row.updated_at,
        None => pending.iter().map(|e| e.base_updated_at).max().unwrap_or(0),
    };

    Ok(LocalView {
        updated_at,
        has_pending: !pending.is_empty(),
    })
}

/// Describes the first reference field that is not an id string.
fn malformed_reference(table: EntityTable, payload: &Payload) -> Option<String> {
    table
        .foreign_keys()
        .iter()
        .find_map(|key| reference(payload, key.field).err())
        .map(|e| e.to_string())
}

/// Translates reference fields from remote to local ids. Unknown parents
/// are stored as null.
async fn to_local_refs(
    conn: &mut SqliteConnection,
    table: EntityTable,
    payload: &Payload,
) -> SyncResult<Payload> {
    let mut local = payload.clone();

    for key in table.foreign_keys() {
        let Some(remote_parent) = reference(payload, key.field)? else {
            continue;
        };

        match identity::resolve_local(&mut *conn, key.parent, &remote_parent).await? {
            Some(local_parent) => {
                local.insert(key.field.to_string(), Value::String(local_parent));
            }
            None => {
                warn!(
                    %table,
                    field = key.field,
                    parent = %key.parent,
                    remote_parent = %remote_parent,
                    "Pulled record references an unknown parent"
                );
                local.insert(key.field.to_string(), Value::Null);
            }
        }
    }

    Ok(local)
}
