//! # Identity Map Repository
//!
//! Local id ⇄ remote id bindings, one pair per record and table.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  identity_map                                                           │
//! │  ┌────────────┬──────────┬───────────┐                                  │
//! │  │ table_name │ local_id │ remote_id │   PK (table_name, local_id)      │
//! │  ├────────────┼──────────┼───────────┤   UNIQUE (table_name, remote_id) │
//! │  │ schema     │ S1       │ r-abc     │                                  │
//! │  │ day        │ D1       │ r-def     │                                  │
//! │  └────────────┴──────────┴───────────┘                                  │
//! │                                                                         │
//! │  Written by push (create acked) and pull (new remote record).           │
//! │  Removed when a delete is acked or a tombstone is applied.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The connection-level functions are used by the sync engine inside its own
//! transactions; [`IdentityRepository`] wraps them for one-off calls.

use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use ironlog_core::EntityTable;

use crate::error::{DbError, DbResult};
use crate::now_millis;

/// Returns the remote id bound to `local_id`, if any.
pub async fn resolve_remote<'e, E>(
    exec: E,
    table: EntityTable,
    local_id: &str,
) -> DbResult<Option<String>>
where
    E: SqliteExecutor<'e>,
{
    let remote_id = sqlx::query_scalar::<_, String>(
        "SELECT remote_id FROM identity_map WHERE table_name = ?1 AND local_id = ?2",
    )
    .bind(table)
    .bind(local_id)
    .fetch_optional(exec)
    .await?;

    Ok(remote_id)
}

/// Returns the local id bound to `remote_id`, if any.
pub async fn resolve_local<'e, E>(
    exec: E,
    table: EntityTable,
    remote_id: &str,
) -> DbResult<Option<String>>
where
    E: SqliteExecutor<'e>,
{
    let local_id = sqlx::query_scalar::<_, String>(
        "SELECT local_id FROM identity_map WHERE table_name = ?1 AND remote_id = ?2",
    )
    .bind(table)
    .bind(remote_id)
    .fetch_optional(exec)
    .await?;

    Ok(local_id)
}

/// Binds `local_id` to `remote_id`.
///
/// Binding a pair that already exists is a no-op. Binding either side to a
/// different partner fails with [`DbError::IdentityConflict`] and writes
/// nothing.
pub async fn bind(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
    remote_id: &str,
) -> DbResult<()> {
    if let Some(existing) = resolve_remote(&mut *conn, table, local_id).await? {
        if existing == remote_id {
            return Ok(());
        }
        return Err(DbError::IdentityConflict {
            table,
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            reason: format!("local id already bound to {}", existing),
        });
    }

    if let Some(owner) = resolve_local(&mut *conn, table, remote_id).await? {
        return Err(DbError::IdentityConflict {
            table,
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            reason: format!("remote id already bound to {}", owner),
        });
    }

    sqlx::query(
        "INSERT INTO identity_map (table_name, local_id, remote_id, bound_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(table)
    .bind(local_id)
    .bind(remote_id)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    debug!(%table, local_id, remote_id, "Bound identity");
    Ok(())
}

/// Removes the binding for `local_id`. Returns true if one existed.
pub async fn unbind<'e, E>(exec: E, table: EntityTable, local_id: &str) -> DbResult<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM identity_map WHERE table_name = ?1 AND local_id = ?2")
        .bind(table)
        .bind(local_id)
        .execute(exec)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// All `(local_id, remote_id)` bindings of a table.
pub async fn bindings<'e, E>(exec: E, table: EntityTable) -> DbResult<Vec<(String, String)>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT local_id, remote_id FROM identity_map WHERE table_name = ?1 ORDER BY local_id",
    )
    .bind(table)
    .fetch_all(exec)
    .await?;

    Ok(rows)
}

/// Repository for identity map lookups outside a sync transaction.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    /// Creates a new IdentityRepository.
    pub fn new(pool: SqlitePool) -> Self {
        IdentityRepository { pool }
    }

    pub async fn resolve_remote(&self, table: EntityTable, local_id: &str) -> DbResult<Option<String>> {
        resolve_remote(&self.pool, table, local_id).await
    }

    pub async fn resolve_local(&self, table: EntityTable, remote_id: &str) -> DbResult<Option<String>> {
        resolve_local(&self.pool, table, remote_id).await
    }

    /// Binds a pair in its own transaction.
    pub async fn bind(&self, table: EntityTable, local_id: &str, remote_id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        bind(&mut tx, table, local_id, remote_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn unbind(&self, table: EntityTable, local_id: &str) -> DbResult<bool> {
        unbind(&self.pool, table, local_id).await
    }

    pub async fn bindings(&self, table: EntityTable) -> DbResult<Vec<(String, String)>> {
        bindings(&self.pool, table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    async fn repo() -> IdentityRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.identity()
    }

    #[tokio::test]
    async fn test_bind_and_resolve_both_ways() {
        let ids = repo().await;
        ids.bind(EntityTable::Schema, "S1", "r-abc").await.unwrap();

        assert_eq!(
            ids.resolve_remote(EntityTable::Schema, "S1").await.unwrap().as_deref(),
            Some("r-abc")
        );
        assert_eq!(
            ids.resolve_local(EntityTable::Schema, "r-abc").await.unwrap().as_deref(),
            Some("S1")
        );
        // Bindings are per table.
        assert!(ids.resolve_local(EntityTable::Day, "r-abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebinding_same_pair_is_noop() {
        let ids = repo().await;
        ids.bind(EntityTable::Schema, "S1", "r-abc").await.unwrap();
        ids.bind(EntityTable::Schema, "S1", "r-abc").await.unwrap();
        assert_eq!(ids.bindings(EntityTable::Schema).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_id_cannot_be_bound_twice() {
        let ids = repo().await;
        ids.bind(EntityTable::Schema, "S1", "r-abc").await.unwrap();

        let err = ids.bind(EntityTable::Schema, "S2", "r-abc").await.unwrap_err();
        assert!(matches!(err, DbError::IdentityConflict { .. }));

        let err = ids.bind(EntityTable::Schema, "S1", "r-xyz").await.unwrap_err();
        assert!(matches!(err, DbError::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn test_unbind() {
        let ids = repo().await;
        ids.bind(EntityTable::Day, "D1", "r-1").await.unwrap();

        assert!(ids.unbind(EntityTable::Day, "D1").await.unwrap());
        assert!(!ids.unbind(EntityTable::Day, "D1").await.unwrap());
        assert!(ids.resolve_remote(EntityTable::Day, "D1").await.unwrap().is_none());
    }
}
