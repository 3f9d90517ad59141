//! # Sync Cursor Repository
//!
//! Per-table pull cursors and a small key/value store for sync markers.
//!
//! A cursor is the highest remote `updated_at` whose batch was fully applied.
//! It only moves forward; [`SyncCursorRepository::reset_all`] is the one way
//! back to zero.

use sqlx::{SqliteExecutor, SqlitePool};
use tracing::{debug, info};

use ironlog_core::EntityTable;

use crate::error::DbResult;
use crate::now_millis;

/// Reads the cursor of a table (0 if never pulled).
pub async fn get<'e, E>(exec: E, table: EntityTable) -> DbResult<i64>
where
    E: SqliteExecutor<'e>,
{
    let cursor: Option<i64> =
        sqlx::query_scalar("SELECT last_pulled_at FROM sync_cursors WHERE table_name = ?1")
            .bind(table)
            .fetch_optional(exec)
            .await?;
    Ok(cursor.unwrap_or(0))
}

/// Advances the cursor of a table. A smaller value leaves it unchanged.
pub async fn advance<'e, E>(exec: E, table: EntityTable, last_pulled_at: i64) -> DbResult<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO sync_cursors (table_name, last_pulled_at, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(table_name) DO UPDATE SET \
             last_pulled_at = MAX(last_pulled_at, excluded.last_pulled_at), \
             updated_at = excluded.updated_at",
    )
    .bind(table)
    .bind(last_pulled_at)
    .bind(now_millis())
    .execute(exec)
    .await?;
    Ok(())
}

/// Repository for pull cursors and sync markers.
#[derive(Debug, Clone)]
pub struct SyncCursorRepository {
    pool: SqlitePool,
}

impl SyncCursorRepository {
    /// Creates a new SyncCursorRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncCursorRepository { pool }
    }

    pub async fn get(&self, table: EntityTable) -> DbResult<i64> {
        get(&self.pool, table).await
    }

    pub async fn advance(&self, table: EntityTable, last_pulled_at: i64) -> DbResult<()> {
        advance(&self.pool, table, last_pulled_at).await
    }

    /// Forgets every cursor; the next pull lists all tables from the start.
    pub async fn reset_all(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_cursors").execute(&self.pool).await?;
        info!("Reset all pull cursors");
        Ok(())
    }

    /// Reads a marker.
    pub async fn get_meta(&self, key: &str) -> DbResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM sync_meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Writes a marker, replacing any previous value.
    pub async fn set_meta(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!(key, value, "Set sync marker");
        Ok(())
    }

    /// Removes a marker. Returns true if it existed.
    pub async fn delete_meta(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM sync_meta WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
