//! SQLite key-value backend.
//!
//! A single table holds every thread record:
//! - `key` — the continuation id
//! - `value` — the serialized thread
//! - `version` — bumped on every write, used for compare-and-swap
//! - `expires_at` — unix milliseconds; rows past it are invisible and
//!   removed by `sweep_expired`
//!
//! Each mutation is one SQL statement, so SQLite's write lock makes
//! compare-and-swap atomic without explicit transactions.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use threadgate_core::error::StoreError;
use threadgate_core::store::{KvBackend, Versioned};
use tracing::{debug, info};

/// A SQLite-backed key-value store with per-row expiry.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        info!("SQLite thread store initialized at {path}");
        Ok(backend)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threadgate_kv (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                version    INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("threadgate_kv table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_threadgate_kv_expires_at ON threadgate_kv(expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("expires_at index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn unavailable(context: &str, e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("{context}: {e}"))
}

#[async_trait]
impl KvBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let row = sqlx::query(
            "SELECT value, version FROM threadgate_kv WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("get", e))?;

        row.map(|row| {
            let value: String = row.try_get("value").map_err(|e| unavailable("value column", e))?;
            let version: i64 = row.try_get("version").map_err(|e| unavailable("version column", e))?;
            Ok(Versioned {
                value,
                version: version as u64,
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, StoreError> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO threadgate_kv (key, value, version, expires_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = threadgate_kv.version + 1,
                expires_at = excluded.expires_at
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unavailable("set", e))?;

        Ok(version as u64)
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        // An expired row counts as absent and is overwritten in place.
        let result = sqlx::query(
            r#"
            INSERT INTO threadgate_kv (key, value, version, expires_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = threadgate_kv.version + 1,
                expires_at = excluded.expires_at
            WHERE threadgate_kv.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("set_if_absent", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE threadgate_kv
            SET value = ?1, version = version + 1, expires_at = ?2
            WHERE key = ?3 AND version = ?4 AND expires_at > ?5
            "#,
        )
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(key)
        .bind(expected as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("compare_and_swap", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM threadgate_kv WHERE expires_at <= ?1")
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("sweep", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM threadgate_kv WHERE expires_at > ?1")
                .bind(now_ms())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| unavailable("count", e))?;

        Ok(count as usize)
    }
}
