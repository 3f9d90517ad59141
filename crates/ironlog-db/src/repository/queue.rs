//! # Mutation Queue Repository
//!
//! Durable, ordered log of local writes awaiting push.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LOCAL WRITE (create / update / delete)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                   SINGLE TRANSACTION                            │    │
//! │  │  1. write the entity row                                        │    │
//! │  │  2. enqueue_in(): plan_enqueue() over the record's pending      │    │
//! │  │     entries, then append / merge / supersede / cancel           │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PUSH (ironlog-sync)                                                    │
//! │  1. peek_batch()        - oldest first, entries stay in the table       │
//! │  2. send to remote                                                      │
//! │  3. ack()               - delete only if the revision is unchanged      │
//! │     record_failure()    - attempts += 1, last_error                     │
//! │     record_deferral()   - parent not yet known remotely                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `revision` is bumped whenever an entry is merged. An ack carries the
//! revision that was sent, so a merge that lands while the entry is in
//! flight is never lost.

use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use ironlog_core::{
    parse_payload, plan_enqueue, EnqueuePlan, EntityTable, MutationOp, Payload, QueueEntry,
    SentEntry,
};

use crate::error::{DbError, DbResult};
use crate::now_millis;

const SELECT_ENTRY: &str = "SELECT id, table_name, op, local_id, payload, enqueued_at, \
     base_updated_at, revision, attempts, deferrals, last_error FROM mutation_queue";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct QueueRow {
    id: i64,
    table_name: EntityTable,
    op: MutationOp,
    local_id: String,
    payload: Option<String>,
    enqueued_at: i64,
    base_updated_at: i64,
    revision: i64,
    attempts: i64,
    deferrals: i64,
    last_error: Option<String>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = DbError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let payload = row.payload.as_deref().map(parse_payload).transpose()?;
        Ok(QueueEntry {
            id: row.id,
            table: row.table_name,
            op: row.op,
            local_id: row.local_id,
            payload,
            enqueued_at: row.enqueued_at,
            base_updated_at: row.base_updated_at,
            revision: row.revision,
            attempts: row.attempts,
            deferrals: row.deferrals,
            last_error: row.last_error,
        })
    }
}

fn into_entries(rows: Vec<QueueRow>) -> DbResult<Vec<QueueEntry>> {
    rows.into_iter().map(QueueEntry::try_from).collect()
}

fn encode(payload: Option<&Payload>) -> DbResult<Option<String>> {
    Ok(payload.map(serde_json::to_string).transpose()?)
}

/// What [`enqueue`] did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Appended { id: i64 },
    /// The mutation was folded into an existing entry.
    Merged { id: i64 },
    /// Pending creates/updates were removed and a delete appended.
    Superseded { id: i64, removed: usize },
    /// A never-pushed create and its edits were removed; nothing remains.
    Cancelled { removed: usize },
    /// The mutation had no effect (record already pending delete).
    Discarded,
}

// =============================================================================
// Connection-Level Operations
// =============================================================================

/// Unacked entries for one record, oldest first.
pub async fn pending_for<'e, E>(
    exec: E,
    table: EntityTable,
    local_id: &str,
) -> DbResult<Vec<QueueEntry>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("{} WHERE table_name = ?1 AND local_id = ?2 ORDER BY id", SELECT_ENTRY);
    let rows = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(table)
        .bind(local_id)
        .fetch_all(exec)
        .await?;

    into_entries(rows)
}

/// Records a mutation, coalescing with the record's pending entries.
///
/// Must run in the same transaction as the entity row write.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    table: EntityTable,
    op: MutationOp,
    local_id: &str,
    payload: Option<&Payload>,
    base_updated_at: i64,
) -> DbResult<EnqueueOutcome> {
    let pending = pending_for(&mut *conn, table, local_id).await?;

    let outcome = match plan_enqueue(&pending, op, payload) {
        EnqueuePlan::Append => {
            let id = insert(conn, table, op, local_id, payload, base_updated_at).await?;
            EnqueueOutcome::Appended { id }
        }
        EnqueuePlan::MergeInto { entry_id, payload } => {
            sqlx::query(
                "UPDATE mutation_queue \
                 SET payload = ?2, base_updated_at = ?3, revision = revision + 1 \
                 WHERE id = ?1",
            )
            .bind(entry_id)
            .bind(encode(Some(&payload))?)
            .bind(base_updated_at)
            .execute(&mut *conn)
            .await?;
            EnqueueOutcome::Merged { id: entry_id }
        }
        EnqueuePlan::Supersede { remove } => {
            let removed = remove_ids(conn, &remove).await?;
            let id = insert(conn, table, op, local_id, payload, base_updated_at).await?;
            EnqueueOutcome::Superseded { id, removed }
        }
        EnqueuePlan::Cancel { remove } => {
            let removed = remove_ids(conn, &remove).await?;
            EnqueueOutcome::Cancelled { removed }
        }
        EnqueuePlan::Discard => EnqueueOutcome::Discarded,
    };

    debug!(%table, %op, local_id, ?outcome, "Enqueued mutation");
    Ok(outcome)
}

async fn insert(
    conn: &mut SqliteConnection,
    table: EntityTable,
    op: MutationOp,
    local_id: &str,
    payload: Option<&Payload>,
    base_updated_at: i64,
) -> DbResult<i64> {
    let result = sqlx::query(
        "INSERT INTO mutation_queue (table_name, op, local_id, payload, enqueued_at, base_updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(table)
    .bind(op)
    .bind(local_id)
    .bind(encode(payload)?)
    .bind(now_millis())
    .bind(base_updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn remove_ids(conn: &mut SqliteConnection, ids: &[i64]) -> DbResult<usize> {
    let mut removed = 0;
    for id in ids {
        removed += remove(&mut *conn, *id).await? as usize;
    }
    Ok(removed)
}

/// Deletes one entry regardless of its revision.
pub async fn remove<'e, E>(exec: E, id: i64) -> DbResult<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?1")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Deletes every entry for a record. Returns how many were removed.
pub async fn remove_for_record<'e, E>(exec: E, table: EntityTable, local_id: &str) -> DbResult<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM mutation_queue WHERE table_name = ?1 AND local_id = ?2")
        .bind(table)
        .bind(local_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

/// Removes an entry only if it was not modified after being sent.
///
/// Returns false if the entry is gone or its revision moved on.
pub async fn ack<'e, E>(exec: E, sent: SentEntry) -> DbResult<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?1 AND revision = ?2")
        .bind(sent.id)
        .bind(sent.revision)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Turns a pushed create into an update, keeping its queue position.
///
/// Used when the create was acknowledged remotely but edits were merged into
/// the entry while it was in flight.
pub async fn convert_to_update<'e, E>(exec: E, id: i64) -> DbResult<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE mutation_queue SET op = ?2 WHERE id = ?1 AND op = ?3")
        .bind(id)
        .bind(MutationOp::Update)
        .bind(MutationOp::Create)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Moves the base timestamp of a record's pending entries forward.
pub async fn rebase<'e, E>(
    exec: E,
    table: EntityTable,
    local_id: &str,
    base_updated_at: i64,
) -> DbResult<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE mutation_queue SET base_updated_at = ?3 \
         WHERE table_name = ?1 AND local_id = ?2 AND base_updated_at < ?3",
    )
    .bind(table)
    .bind(local_id)
    .bind(base_updated_at)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

/// Fetches one entry by id.
pub async fn get<'e, E>(exec: E, id: i64) -> DbResult<Option<QueueEntry>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("{} WHERE id = ?1", SELECT_ENTRY);
    let row = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.map(QueueEntry::try_from).transpose()
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for mutation queue operations.
#[derive(Debug, Clone)]
pub struct MutationQueueRepository {
    pool: SqlitePool,
}

impl MutationQueueRepository {
    /// Creates a new MutationQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MutationQueueRepository { pool }
    }

    /// Enqueues a mutation on its own, without an entity row write.
    pub async fn enqueue(
        &self,
        table: EntityTable,
        op: MutationOp,
        local_id: &str,
        payload: Option<&Payload>,
        base_updated_at: i64,
    ) -> DbResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = enqueue(&mut tx, table, op, local_id, payload, base_updated_at).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Oldest entries first, without removing them.
    pub async fn peek_batch(&self, limit: u32) -> DbResult<Vec<QueueEntry>> {
        let sql = format!("{} ORDER BY id LIMIT ?1", SELECT_ENTRY);
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        into_entries(rows)
    }

    /// Fetches one entry by id.
    pub async fn get(&self, id: i64) -> DbResult<Option<QueueEntry>> {
        get(&self.pool, id).await
    }

    pub async fn pending_for(&self, table: EntityTable, local_id: &str) -> DbResult<Vec<QueueEntry>> {
        pending_for(&self.pool, table, local_id).await
    }

    /// Returns true if a create for the record has not been acked yet.
    pub async fn has_pending_create(&self, table: EntityTable, local_id: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mutation_queue WHERE table_name = ?1 AND local_id = ?2 AND op = ?3",
        )
        .bind(table)
        .bind(local_id)
        .bind(MutationOp::Create)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Number of unacked entries.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// See [`ack`].
    pub async fn ack(&self, sent: SentEntry) -> DbResult<bool> {
        ack(&self.pool, sent).await
    }

    /// Deletes one entry regardless of its revision.
    pub async fn remove(&self, id: i64) -> DbResult<bool> {
        remove(&self.pool, id).await
    }

    /// Records a failed attempt.
    pub async fn record_failure(&self, id: i64, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE mutation_queue SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        debug!(id, error, "Recorded push failure");
        Ok(())
    }

    /// Records that an entry was held back for an unresolved parent.
    ///
    /// Returns the new deferral count.
    pub async fn record_deferral(&self, id: i64, reason: &str) -> DbResult<i64> {
        let deferrals: Option<i64> = sqlx::query_scalar(
            "UPDATE mutation_queue SET deferrals = deferrals + 1, last_error = ?2 \
             WHERE id = ?1 RETURNING deferrals",
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        deferrals.ok_or_else(|| DbError::not_found("Queue entry", id.to_string()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn queue() -> MutationQueueRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().queue()
    }

    #[tokio::test]
    async fn test_entries_are_served_in_order() {
        let q = queue().await;
        let p = payload(json!({ "name": "A" }));
        q.enqueue(EntityTable::Schema, MutationOp::Create, "S1", Some(&p), 1).await.unwrap();
        q.enqueue(EntityTable::Day, MutationOp::Create, "D1", Some(&p), 2).await.unwrap();
        q.enqueue(EntityTable::Schema, MutationOp::Create, "S2", Some(&p), 3).await.unwrap();

        let batch = q.peek_batch(10).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|e| e.local_id.as_str()).collect();
        assert_eq!(ids, ["S1", "D1", "S2"]);
        assert_eq!(batch[0].payload.as_ref().unwrap()["name"], "A");
        assert_eq!(q.count_pending().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_updates_coalesce_into_one_entry() {
        let q = queue().await;
        let first = payload(json!({ "name": "A", "reps": 5 }));
        let second = payload(json!({ "reps": 8 }));
        q.enqueue(EntityTable::Exercise, MutationOp::Update, "E1", Some(&first), 10).await.unwrap();
        let outcome = q
            .enqueue(EntityTable::Exercise, MutationOp::Update, "E1", Some(&second), 11)
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Merged { .. }));

        let pending = q.pending_for(EntityTable::Exercise, "E1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, Some(payload(json!({ "name": "A", "reps": 8 }))));
        assert_eq!(pending[0].revision, 1);
        assert_eq!(pending[0].base_updated_at, 11);
    }

    #[tokio::test]
    async fn test_delete_cancels_unpushed_create() {
        let q = queue().await;
        let p = payload(json!({}));
        q.enqueue(EntityTable::Schema, MutationOp::Create, "S1", Some(&p), 1).await.unwrap();
        let outcome = q.enqueue(EntityTable::Schema, MutationOp::Delete, "S1", None, 2).await.unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled { removed: 1 });
        assert_eq!(q.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_supersedes_pending_update() {
        let q = queue().await;
        let p = payload(json!({ "name": "B" }));
        q.enqueue(EntityTable::Schema, MutationOp::Update, "S1", Some(&p), 1).await.unwrap();
        q.enqueue(EntityTable::Schema, MutationOp::Delete, "S1", None, 2).await.unwrap();

        let pending = q.pending_for(EntityTable::Schema, "S1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, MutationOp::Delete);
        assert!(pending[0].payload.is_none());
    }

    #[tokio::test]
    async fn test_ack_requires_matching_revision() {
        let q = queue().await;
        let p = payload(json!({ "name": "A" }));
        q.enqueue(EntityTable::Schema, MutationOp::Create, "S1", Some(&p), 1).await.unwrap();
        let sent = q.peek_batch(1).await.unwrap()[0].sent();

        // Edited while in flight.
        let edit = payload(json!({ "name": "B" }));
        q.enqueue(EntityTable::Schema, MutationOp::Update, "S1", Some(&edit), 2).await.unwrap();

        assert!(!q.ack(sent).await.unwrap());
        let entry = q.get(sent.id).await.unwrap().unwrap();
        assert_eq!(entry.payload.unwrap()["name"], "B");

        assert!(q.ack(entry_sent(&q, sent.id).await).await.unwrap());
        assert_eq!(q.count_pending().await.unwrap(), 0);
    }

    async fn entry_sent(q: &MutationQueueRepository, id: i64) -> SentEntry {
        q.get(id).await.unwrap().unwrap().sent()
    }

    #[tokio::test]
    async fn test_convert_create_to_update() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let q = db.queue();
        let p = payload(json!({ "name": "A" }));
        q.enqueue(EntityTable::Schema, MutationOp::Create, "S1", Some(&p), 1).await.unwrap();
        let id = q.peek_batch(1).await.unwrap()[0].id;

        assert!(convert_to_update(db.pool(), id).await.unwrap());
        assert!(!q.has_pending_create(EntityTable::Schema, "S1").await.unwrap());
        assert_eq!(q.get(id).await.unwrap().unwrap().op, MutationOp::Update);
    }

    #[tokio::test]
    async fn test_failures_and_deferrals_are_counted() {
        let q = queue().await;
        let p = payload(json!({}));
        q.enqueue(EntityTable::Day, MutationOp::Create, "D1", Some(&p), 1).await.unwrap();
        let id = q.peek_batch(1).await.unwrap()[0].id;

        q.record_failure(id, "timeout").await.unwrap();
        assert_eq!(q.record_deferral(id, "parent unresolved").await.unwrap(), 1);
        assert_eq!(q.record_deferral(id, "parent unresolved").await.unwrap(), 2);

        let entry = q.get(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.deferrals, 2);
        assert_eq!(entry.last_error.as_deref(), Some("parent unresolved"));

        assert!(q.record_deferral(9999, "x").await.unwrap_err().is_not_found());
    }
}
