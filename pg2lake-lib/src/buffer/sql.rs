use super::{BufferConfig, EventBuffer, ReadinessTracker};
use crate::error::{CdcError, Result};
use crate::store::{from_micros, to_micros};
use crate::types::{BufferedEvent, ChangeEvent, Operation, RowData};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Buffer persisted in the `cdc_events` table of a SQLite database
pub struct SqlEventBuffer {
    pool: SqlitePool,
    config: BufferConfig,
    tracker: ReadinessTracker,
    malformed: AtomicU64,
}

impl SqlEventBuffer {
    /// Bind to an already migrated pool; picks up unprocessed rows left by a previous run
    pub async fn new(pool: SqlitePool, config: BufferConfig) -> Result<Self> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cdc_events WHERE source_id = ? AND processed_at IS NULL",
        )
        .bind(&config.source_id)
        .fetch_one(&pool)
        .await?;

        if pending > 0 {
            info!(
                "Buffer for source {} holds {} unprocessed events from a previous run",
                config.source_id, pending
            );
        }

        let tracker = ReadinessTracker::new(config.batch_size, config.flush_interval, pending as usize);
        Ok(Self {
            pool,
            config,
            tracker,
            malformed: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_row(row: &SqliteRow) -> Result<BufferedEvent> {
        let operation: String = row.try_get("operation")?;
        let position: String = row.try_get("position")?;
        let transaction_id: Option<i64> = row.try_get("transaction_id")?;
        let key_columns: String = row.try_get("key_columns")?;
        let before: Option<String> = row.try_get("before")?;
        let after: Option<String> = row.try_get("after")?;
        let processed_at: Option<i64> = row.try_get("processed_at")?;

        let event = ChangeEvent {
            source_id: row.try_get("source_id")?,
            schema_name: row.try_get("schema_name")?,
            table_name: row.try_get("table_name")?,
            operation: operation.parse::<Operation>()?,
            position: position.parse()?,
            transaction_id: transaction_id
                .map(|xid| {
                    u32::try_from(xid)
                        .map_err(|_| CdcError::malformed(format!("Invalid transaction id {}", xid)))
                })
                .transpose()?,
            event_time: from_micros(row.try_get("event_time")?)?,
            key_columns: serde_json::from_str(&key_columns)?,
            before: before.map(|b| serde_json::from_str::<RowData>(&b)).transpose()?,
            after: after.map(|a| serde_json::from_str::<RowData>(&a)).transpose()?,
        };
        event.validate()?;

        Ok(BufferedEvent {
            id: row.try_get("id")?,
            event,
            created_at: from_micros(row.try_get("created_at")?)?,
            processed_at: processed_at.map(from_micros).transpose()?,
        })
    }

    async fn set_processed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE cdc_events SET processed_at = ");
        query.push_bind(to_micros(Utc::now()));
        query.push(" WHERE processed_at IS NULL AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventBuffer for SqlEventBuffer {
    async fn write(&self, event: &ChangeEvent) -> Result<i64> {
        event.validate()?;
        let before = event.before.as_ref().map(serde_json::to_string).transpose()?;
        let after = event.after.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO cdc_events
                (source_id, schema_name, table_name, operation, position, transaction_id,
                 key_columns, "before", "after", event_time, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&event.source_id)
        .bind(&event.schema_name)
        .bind(&event.table_name)
        .bind(event.operation.as_str())
        .bind(event.position.to_string())
        .bind(event.transaction_id.map(i64::from))
        .bind(serde_json::to_string(&event.key_columns)?)
        .bind(before)
        .bind(after)
        .bind(to_micros(event.event_time))
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.tracker.record_write();
        Ok(result.last_insert_rowid())
    }

    fn ready(&self) -> bool {
        self.tracker.ready()
    }

    fn depth(&self) -> usize {
        self.tracker.unprocessed()
    }

    async fn flush(&self) -> Result<Vec<BufferedEvent>> {
        let rows = sqlx::query(
            r#"SELECT id, source_id, schema_name, table_name, operation, position, transaction_id,
                      key_columns, "before", "after", event_time, created_at, processed_at
               FROM cdc_events
               WHERE source_id = ? AND processed_at IS NULL
               ORDER BY id
               LIMIT ?"#,
        )
        .bind(&self.config.source_id)
        .bind(self.config.batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        self.tracker.record_flush();

        let mut events = Vec::with_capacity(rows.len());
        let mut malformed = Vec::new();
        for row in &rows {
            match Self::decode_row(row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    let id: i64 = row.try_get("id")?;
                    warn!("Skipping malformed buffered event {}: {}", id, e);
                    malformed.push(id);
                }
            }
        }

        if !malformed.is_empty() {
            let skipped = self.set_processed(&malformed).await?;
            self.tracker.record_processed(skipped as usize);
            self.malformed.fetch_add(skipped, Ordering::Relaxed);
        }

        debug!("Flushed {} buffered events", events.len());
        Ok(events)
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        let updated = self.set_processed(ids).await?;
        self.tracker.record_processed(updated as usize);
        Ok(updated)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| CdcError::config(format!("Invalid retention: {}", e)))?;
        let cutoff = to_micros(Utc::now() - retention);

        let result = sqlx::query(
            "DELETE FROM cdc_events WHERE processed_at IS NOT NULL AND processed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("Buffer cleanup removed {} processed events", removed);
        }
        Ok(removed)
    }

    fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_sqlite_pool;
    use crate::types::Position;

    fn config(batch_size: usize) -> BufferConfig {
        BufferConfig {
            source_id: "src".to_string(),
            batch_size,
            flush_interval: Duration::from_secs(3600),
        }
    }

    fn insert(sequence: u32, name: &str) -> ChangeEvent {
        let mut row = RowData::new();
        row.insert("id".to_string(), (sequence as i64).into());
        row.insert("name".to_string(), name.into());
        ChangeEvent::insert("src", "public", "users", Position::new(0x10, sequence), row)
            .with_transaction(5)
            .with_key_columns(vec!["id".to_string()])
    }

    #[tokio::test]
    async fn test_write_flush_mark_processed() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let buffer = SqlEventBuffer::new(pool, config(2)).await.unwrap();

        let first = buffer.write(&insert(0, "alice")).await.unwrap();
        let second = buffer.write(&insert(1, "bob")).await.unwrap();
        buffer.write(&insert(2, "carol")).await.unwrap();
        assert!(second > first);
        assert_eq!(buffer.depth(), 3);
        assert!(buffer.ready());

        let batch = buffer.flush().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event, insert(0, "alice").with_event_time(batch[0].event.event_time));
        assert_eq!(batch[1].id, second);

        // still visible until marked
        assert_eq!(buffer.flush().await.unwrap().len(), 2);

        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(buffer.mark_processed(&ids).await.unwrap(), 2);
        assert_eq!(buffer.mark_processed(&ids).await.unwrap(), 0);
        assert_eq!(buffer.depth(), 1);

        let rest = buffer.flush().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.position, Position::new(0x10, 2));
    }

    #[tokio::test]
    async fn test_flush_is_scoped_to_source() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let buffer = SqlEventBuffer::new(pool.clone(), config(10)).await.unwrap();
        let mut other = insert(0, "x");
        other.source_id = "other".to_string();
        buffer.write(&other).await.unwrap();
        buffer.write(&insert(1, "mine")).await.unwrap();

        let batch = buffer.flush().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.source_id, "src");
    }

    #[tokio::test]
    async fn test_unprocessed_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("buffer.db").display());

        let pool = open_sqlite_pool(&url).await.unwrap();
        let buffer = SqlEventBuffer::new(pool.clone(), config(10)).await.unwrap();
        buffer.write(&insert(0, "alice")).await.unwrap();
        buffer.write(&insert(1, "bob")).await.unwrap();
        pool.close().await;

        let pool = open_sqlite_pool(&url).await.unwrap();
        let reopened = SqlEventBuffer::new(pool, config(10)).await.unwrap();
        assert_eq!(reopened.depth(), 2);
        assert_eq!(reopened.flush().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped_and_marked() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let buffer = SqlEventBuffer::new(pool.clone(), config(10)).await.unwrap();
        buffer.write(&insert(0, "alice")).await.unwrap();
        sqlx::query(
            r#"INSERT INTO cdc_events
                (source_id, schema_name, table_name, operation, position, key_columns, "after", event_time, created_at)
               VALUES ('src', 'public', 'users', 'UPSERT', 'garbage', '[]', '{', 0, 0)"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let batch = buffer.flush().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(buffer.malformed_count(), 1);
        assert_eq!(buffer.flush().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let buffer = SqlEventBuffer::new(pool.clone(), config(10)).await.unwrap();
        let old = buffer.write(&insert(0, "old")).await.unwrap();
        let recent = buffer.write(&insert(1, "recent")).await.unwrap();
        buffer.write(&insert(2, "pending")).await.unwrap();
        buffer.mark_processed(&[old, recent]).await.unwrap();

        let two_days_ago = to_micros(Utc::now() - chrono::Duration::days(2));
        sqlx::query("UPDATE cdc_events SET processed_at = ? WHERE id = ?")
            .bind(two_days_ago)
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();

        let removed = buffer.cleanup(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(removed, 1);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdc_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_inconsistent_event_is_rejected() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let buffer = SqlEventBuffer::new(pool, config(10)).await.unwrap();
        let mut event = insert(0, "alice");
        event.before = Some(RowData::new());
        assert!(matches!(
            buffer.write(&event).await.unwrap_err(),
            CdcError::MalformedEvent(_)
        ));
    }
}
