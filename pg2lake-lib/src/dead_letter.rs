//! Dead-letter sink for events that exhausted their retry budget

use crate::error::{CdcError, ErrorKind, Result};
use crate::store::{from_micros, to_micros};
use crate::types::ChangeEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub source_id: String,
    /// Buffer id of the event, when it came from the buffer
    pub event_id: Option<i64>,
    pub original_event: ChangeEvent,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        event_id: Option<i64>,
        event: ChangeEvent,
        error: &CdcError,
        retry_count: u32,
        ttl: Duration,
    ) -> Self {
        let failed_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            source_id: event.source_id.clone(),
            event_id,
            original_event: event,
            error_message: error.to_string(),
            error_type: error.kind().as_str().to_string(),
            retry_count,
            failed_at,
            expires_at: failed_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        [
            ErrorKind::Transient,
            ErrorKind::MalformedEvent,
            ErrorKind::Encoding,
            ErrorKind::Consistency,
            ErrorKind::Unrecoverable,
            ErrorKind::Cancelled,
        ]
        .into_iter()
        .find(|k| k.as_str() == self.error_type)
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: DeadLetterRecord) -> Result<()>;

    /// Delete records whose `expires_at` has passed; returns how many
    async fn purge_expired(&self) -> Result<u64>;

    async fn count(&self, source_id: &str) -> Result<u64>;
}

/// Dead letters in the `cdc_dead_letters` table
pub struct SqlDeadLetterSink {
    pool: SqlitePool,
}

impl SqlDeadLetterSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, source_id: &str) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query(
            "SELECT source_id, event_id, original_event, error_message, error_type, retry_count,
                    failed_at, expires_at
             FROM cdc_dead_letters WHERE source_id = ? ORDER BY id",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let original: String = row.try_get("original_event")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            records.push(DeadLetterRecord {
                source_id: row.try_get("source_id")?,
                event_id: row.try_get("event_id")?,
                original_event: serde_json::from_str(&original)?,
                error_message: row.try_get("error_message")?,
                error_type: row.try_get("error_type")?,
                retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
                failed_at: from_micros(row.try_get("failed_at")?)?,
                expires_at: from_micros(row.try_get("expires_at")?)?,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterSink for SqlDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO cdc_dead_letters
                (source_id, event_id, original_event, error_message, error_type, retry_count,
                 failed_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.source_id)
        .bind(record.event_id)
        .bind(serde_json::to_string(&record.original_event)?)
        .bind(&record.error_message)
        .bind(&record.error_type)
        .bind(i64::from(record.retry_count))
        .bind(to_micros(record.failed_at))
        .bind(to_micros(record.expires_at))
        .execute(&self.pool)
        .await?;

        warn!(
            "Dead-lettered event {} of {} after {} attempts: {}",
            record.original_event.position,
            record.original_event.qualified_table(),
            record.retry_count,
            record.error_message
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cdc_dead_letters WHERE expires_at < ?")
            .bind(to_micros(Utc::now()))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!("Purged {} expired dead letters", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    async fn count(&self, source_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdc_dead_letters WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        warn!(
            "Dead-lettered event {} of {}: {}",
            record.original_event.position,
            record.original_event.qualified_table(),
            record.error_message
        );
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.expires_at >= now);
        Ok((before - records.len()) as u64)
    }

    async fn count(&self, source_id: &str) -> Result<u64> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.source_id == source_id)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_sqlite_pool;
    use crate::types::{Position, RowData};

    fn event() -> ChangeEvent {
        let mut row = RowData::new();
        row.insert("id".to_string(), 1.into());
        ChangeEvent::insert("src", "public", "users", Position::new(0x20, 1), row)
    }

    #[test]
    fn test_record_carries_error_kind() {
        let record = DeadLetterRecord::new(
            Some(4),
            event(),
            &CdcError::encoding("bad value"),
            3,
            Duration::from_secs(60),
        );
        assert_eq!(record.error_type, "encoding");
        assert_eq!(record.error_kind(), Some(ErrorKind::Encoding));
        assert_eq!(record.source_id, "src");
        assert!(record.expires_at > record.failed_at);
    }

    #[tokio::test]
    async fn test_sql_sink_records_and_purges() {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let sink = SqlDeadLetterSink::new(pool);

        let kept = DeadLetterRecord::new(Some(1), event(), &CdcError::encoding("x"), 3, Duration::from_secs(3600));
        let expired = DeadLetterRecord::new(Some(2), event(), &CdcError::malformed("y"), 3, Duration::ZERO);
        sink.record(kept.clone()).await.unwrap();
        sink.record(expired).await.unwrap();
        assert_eq!(sink.count("src").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sink.purge_expired().await.unwrap(), 1);

        let records = sink.list("src").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, Some(1));
        assert_eq!(records[0].original_event, kept.original_event);
        assert_eq!(records[0].error_type, "encoding");
    }

    #[tokio::test]
    async fn test_memory_sink_purges() {
        let sink = MemoryDeadLetterSink::new();
        sink.record(DeadLetterRecord::new(None, event(), &CdcError::encoding("x"), 1, Duration::ZERO))
            .await
            .unwrap();
        sink.record(DeadLetterRecord::new(None, event(), &CdcError::encoding("x"), 1, Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sink.purge_expired().await.unwrap(), 1);
        assert_eq!(sink.count("src").await.unwrap(), 1);
        assert_eq!(sink.count("other").await.unwrap(), 0);
    }
}
