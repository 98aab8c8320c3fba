//! Shared SQLite pool for the buffer, checkpoint and dead-letter stores

use crate::error::{CdcError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS cdc_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        schema_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        operation TEXT NOT NULL,
        position TEXT NOT NULL,
        transaction_id INTEGER,
        key_columns TEXT NOT NULL,
        "before" TEXT,
        "after" TEXT,
        event_time INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        processed_at INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cdc_events_unprocessed ON cdc_events (source_id, processed_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_cdc_events_processed_at ON cdc_events (processed_at)",
    r#"CREATE TABLE IF NOT EXISTS cdc_checkpoints (
        source_id TEXT PRIMARY KEY,
        position TEXT NOT NULL,
        transaction_id INTEGER,
        committed_at INTEGER NOT NULL,
        metadata TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cdc_dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        event_id INTEGER,
        original_event TEXT NOT NULL,
        error_message TEXT NOT NULL,
        error_type TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        failed_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cdc_dead_letters_expires_at ON cdc_dead_letters (expires_at)",
];

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Open a SQLite pool and create the pipeline tables.
///
/// File databases are created on demand and use WAL journaling. In-memory
/// URLs get a single, never-recycled connection so the database outlives
/// individual queries.
pub async fn open_sqlite_pool(url: &str) -> Result<SqlitePool> {
    let pool = if is_memory_url(url) {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CdcError::config(format!("Invalid SQLite URL '{}': {}", url, e)))?;
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let db_path = url.strip_prefix("sqlite://").unwrap_or(url);
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))
            .map_err(|e| CdcError::config(format!("Invalid SQLite URL '{}': {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().connect_with(options).await?
    };

    migrate(&pool).await?;
    info!("SQLite store ready at {}", url);
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| CdcError::malformed(format!("Timestamp out of range: {}", micros)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_keeps_tables() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdc_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("buffer.db");
        let url = format!("sqlite://{}", path.display());
        let pool = open_sqlite_pool(&url).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }

    #[test]
    fn test_micros_round_trip() {
        let now = Utc::now();
        let back = from_micros(to_micros(now)).unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }
}
