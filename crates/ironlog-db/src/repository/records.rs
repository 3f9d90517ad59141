//! # Entity Record Repository
//!
//! The six synced tables share one row shape, so one repository serves all
//! of them, parameterized by [`EntityTable`].
//!
//! ## Local Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create(table, payload)                                                 │
//! │  update(table, local_id, patch)       ┌──── one transaction ────┐       │
//! │  delete(table, local_id)        ───►  │ entity row write        │       │
//! │                                       │ queue::enqueue()        │       │
//! │                                       └─────────────────────────┘       │
//! │  Either both land or neither does. The sync engine is never called.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The free functions below write rows without touching the queue. The pull
//! side uses them inside its per-table transaction.

use std::sync::Arc;

use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};
use tokio::sync::watch;
use tracing::{debug, instrument};

use ironlog_core::{
    merge_payload, new_local_id, next_updated_at, parse_payload, reference, EntityRecord,
    EntityTable, MutationOp, Payload,
};

use crate::error::{DbError, DbResult};
use crate::now_millis;
use crate::repository::queue;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct RecordRow {
    local_id: String,
    payload: String,
    updated_at: i64,
    remote_id: Option<String>,
}

impl RecordRow {
    fn into_record(self, table: EntityTable) -> DbResult<EntityRecord> {
        Ok(EntityRecord {
            table,
            local_id: self.local_id,
            remote_id: self.remote_id,
            updated_at: self.updated_at,
            payload: parse_payload(&self.payload)?,
        })
    }
}

/// An entity row as stored, without its identity binding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub payload: Payload,
    pub updated_at: i64,
}

fn select_with_remote(table: EntityTable) -> String {
    format!(
        "SELECT r.local_id, r.payload, r.updated_at, m.remote_id \
         FROM {} r \
         LEFT JOIN identity_map m ON m.table_name = ?1 AND m.local_id = r.local_id",
        table.sql_table()
    )
}

/// Rejects payloads whose reference fields are not string ids.
fn validate(table: EntityTable, payload: &Payload) -> DbResult<()> {
    for key in table.foreign_keys() {
        reference(payload, key.field)?;
    }
    Ok(())
}

// =============================================================================
// Connection-Level Operations
// =============================================================================

/// Loads a row without its binding.
pub async fn fetch_row<'e, E>(exec: E, table: EntityTable, local_id: &str) -> DbResult<Option<StoredRow>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT payload, updated_at FROM {} WHERE local_id = ?1",
        table.sql_table()
    );
    let row = sqlx::query_as::<_, (String, i64)>(&sql)
        .bind(local_id)
        .fetch_optional(exec)
        .await?;

    row.map(|(payload, updated_at)| {
        Ok(StoredRow {
            payload: parse_payload(&payload)?,
            updated_at,
        })
    })
    .transpose()
}

/// Inserts or replaces a row.
pub async fn upsert_row<'e, E>(
    exec: E,
    table: EntityTable,
    local_id: &str,
    payload: &Payload,
    updated_at: i64,
) -> DbResult<()>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO {} (local_id, payload, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(local_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        table.sql_table()
    );
    sqlx::query(&sql)
        .bind(local_id)
        .bind(serde_json::to_string(payload)?)
        .bind(updated_at)
        .execute(exec)
        .await?;
    Ok(())
}

/// Deletes a row. Returns true if it existed.
pub async fn delete_row<'e, E>(exec: E, table: EntityTable, local_id: &str) -> DbResult<bool>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("DELETE FROM {} WHERE local_id = ?1", table.sql_table());
    let result = sqlx::query(&sql).bind(local_id).execute(exec).await?;
    Ok(result.rows_affected() > 0)
}

/// Aligns a row's timestamp with the version the remote just accepted.
///
/// If the row still carries the timestamp that was pushed (`base_updated_at`)
/// it adopts `remote_updated_at`, so pulling the same version back is a
/// no-op. If the row was edited after the push, the edit is moved past
/// `remote_updated_at` so it keeps winning against the version it replaced.
/// Returns the row's resulting timestamp, or `None` if the row is gone.
pub async fn adopt_remote_timestamp(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
    base_updated_at: i64,
    remote_updated_at: i64,
) -> DbResult<Option<i64>> {
    let Some(row) = fetch_row(&mut *conn, table, local_id).await? else {
        return Ok(None);
    };

    let target = if row.updated_at == base_updated_at {
        row.updated_at.max(remote_updated_at)
    } else if row.updated_at <= remote_updated_at {
        remote_updated_at + 1
    } else {
        row.updated_at
    };

    if target != row.updated_at {
        let sql = format!(
            "UPDATE {} SET updated_at = ?2 WHERE local_id = ?1",
            table.sql_table()
        );
        sqlx::query(&sql)
            .bind(local_id)
            .bind(target)
            .execute(&mut *conn)
            .await?;

        if row.updated_at != base_updated_at {
            queue::rebase(&mut *conn, table, local_id, target).await?;
        }
        debug!(%table, local_id, from = row.updated_at, to = target, "Adopted remote timestamp");
    }

    Ok(Some(target))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for entity rows and the local write API.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
    changes: Arc<watch::Sender<u64>>,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool, changes: Arc<watch::Sender<u64>>) -> Self {
        RecordRepository { pool, changes }
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Creates a record under a fresh local id and enqueues the create.
    ///
    /// Reference fields in `payload` hold local ids.
    #[instrument(skip(self, payload))]
    pub async fn create(&self, table: EntityTable, payload: Payload) -> DbResult<EntityRecord> {
        validate(table, &payload)?;

        let local_id = new_local_id();
        let updated_at = now_millis();

        let mut tx = self.pool.begin().await?;
        upsert_row(&mut *tx, table, &local_id, &payload, updated_at).await?;
        queue::enqueue(&mut tx, table, MutationOp::Create, &local_id, Some(&payload), updated_at)
            .await?;
        tx.commit().await?;
        self.notify();

        debug!(local_id = %local_id, "Created record");

        Ok(EntityRecord {
            table,
            local_id,
            remote_id: None,
            updated_at,
            payload,
        })
    }

    /// Applies `patch` to a record and enqueues the update.
    ///
    /// Fields absent from `patch` are left unchanged.
    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        table: EntityTable,
        local_id: &str,
        patch: Payload,
    ) -> DbResult<EntityRecord> {
        validate(table, &patch)?;

        let mut tx = self.pool.begin().await?;
        let row = fetch_row(&mut *tx, table, local_id)
            .await?
            .ok_or_else(|| DbError::not_found(table.as_str(), local_id))?;

        let mut payload = row.payload;
        merge_payload(&mut payload, &patch);
        let updated_at = next_updated_at(Some(row.updated_at), now_millis());

        upsert_row(&mut *tx, table, local_id, &payload, updated_at).await?;
        queue::enqueue(&mut tx, table, MutationOp::Update, local_id, Some(&patch), updated_at)
            .await?;
        let remote_id = super::identity::resolve_remote(&mut *tx, table, local_id).await?;
        tx.commit().await?;
        self.notify();

        debug!(local_id, "Updated record");

        Ok(EntityRecord {
            table,
            local_id: local_id.to_string(),
            remote_id,
            updated_at,
            payload,
        })
    }

    /// Deletes a record and enqueues the delete.
    ///
    /// The identity binding stays until the remote acknowledges the delete.
    #[instrument(skip(self))]
    pub async fn delete(&self, table: EntityTable, local_id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = fetch_row(&mut *tx, table, local_id)
            .await?
            .ok_or_else(|| DbError::not_found(table.as_str(), local_id))?;

        delete_row(&mut *tx, table, local_id).await?;
        let updated_at = next_updated_at(Some(row.updated_at), now_millis());
        queue::enqueue(&mut tx, table, MutationOp::Delete, local_id, None, updated_at).await?;
        tx.commit().await?;
        self.notify();

        debug!(local_id, "Deleted record");
        Ok(())
    }

    /// Loads one record with its remote id.
    pub async fn get(&self, table: EntityTable, local_id: &str) -> DbResult<Option<EntityRecord>> {
        let sql = format!("{} WHERE r.local_id = ?2", select_with_remote(table));
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(table)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_record(table)).transpose()
    }

    /// Loads every record of a table, oldest first.
    pub async fn list(&self, table: EntityTable) -> DbResult<Vec<EntityRecord>> {
        let sql = format!("{} ORDER BY r.updated_at, r.local_id", select_with_remote(table));
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_record(table)).collect()
    }

    /// Number of rows in a table.
    pub async fn count(&self, table: EntityTable) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.sql_table());
        Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await?)
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

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_writes_row_and_queue_entry() {
        let db = db().await;
        let record = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "Push/Pull/Legs" })))
            .await
            .unwrap();

        let stored = db.records().get(EntityTable::Schema, &record.local_id).await.unwrap().unwrap();
        assert_eq!(stored.payload["name"], "Push/Pull/Legs");
        assert!(stored.remote_id.is_none());

        let pending = db.queue().peek_batch(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, MutationOp::Create);
        assert_eq!(pending[0].local_id, record.local_id);
        assert_eq!(pending[0].base_updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_committed_writes_notify_subscribers() {
        let db = db().await;
        let mut changes = db.subscribe_changes();
        let records = db.records();

        let created = records
            .create(EntityTable::Schema, payload(json!({ "name": "GZCLP" })))
            .await
            .unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        // A failed write commits nothing and notifies nobody.
        assert!(records
            .update(EntityTable::Schema, "missing", payload(json!({ "name": "x" })))
            .await
            .is_err());
        assert!(!changes.has_changed().unwrap());

        records.delete(EntityTable::Schema, &created.local_id).await.unwrap();
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_advances_timestamp() {
        let db = db().await;
        let records = db.records();
        let created = records
            .create(EntityTable::Exercise, payload(json!({ "name": "Squat", "sets": 3 })))
            .await
            .unwrap();

        let updated = records
            .update(EntityTable::Exercise, &created.local_id, payload(json!({ "sets": 5 })))
            .await
            .unwrap();

        assert_eq!(updated.payload, payload(json!({ "name": "Squat", "sets": 5 })));
        assert!(updated.updated_at > created.updated_at);

        // The update folded into the pending create.
        let pending = db.queue().peek_batch(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, MutationOp::Create);
        assert_eq!(pending[0].payload.as_ref().unwrap()["sets"], 5);
    }

    #[tokio::test]
    async fn test_update_missing_record_writes_nothing() {
        let db = db().await;
        let err = db
            .records()
            .update(EntityTable::Day, "nope", payload(json!({ "name": "x" })))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reference_is_rejected() {
        let db = db().await;
        let err = db
            .records()
            .create(EntityTable::Day, payload(json!({ "schemaId": 42 })))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Invalid(_)));
        assert_eq!(db.records().count(EntityTable::Day).await.unwrap(), 0);
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_unpushed_record_leaves_nothing_queued() {
        let db = db().await;
        let created = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "A" })))
            .await
            .unwrap();

        db.records().delete(EntityTable::Schema, &created.local_id).await.unwrap();

        assert!(db.records().get(EntityTable::Schema, &created.local_id).await.unwrap().is_none());
        assert_eq!(db.queue().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_includes_remote_id() {
        let db = db().await;
        let created = db
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "A" })))
            .await
            .unwrap();
        db.identity().bind(EntityTable::Schema, &created.local_id, "r-abc").await.unwrap();

        let record = db.records().get(EntityTable::Schema, &created.local_id).await.unwrap().unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("r-abc"));
        assert_eq!(db.records().list(EntityTable::Schema).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_adopt_remote_timestamp() {
        let db = db().await;
        upsert_row(db.pool(), EntityTable::Schema, "S1", &payload(json!({})), 100).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        // Unchanged since the push: take the remote stamp.
        let ts = adopt_remote_timestamp(&mut conn, EntityTable::Schema, "S1", 100, 150).await.unwrap();
        assert_eq!(ts, Some(150));

        // Edited after the push: stay ahead of the remote stamp.
        let ts = adopt_remote_timestamp(&mut conn, EntityTable::Schema, "S1", 120, 160).await.unwrap();
        assert_eq!(ts, Some(161));

        let gone = adopt_remote_timestamp(&mut conn, EntityTable::Schema, "S9", 1, 2).await.unwrap();
        assert!(gone.is_none());
    }
}
