use super::{regression, CheckpointStore};
use crate::error::{CdcError, Result};
use crate::store::{from_micros, to_micros};
use crate::types::Checkpoint;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// Checkpoints in the `cdc_checkpoints` table.
///
/// The regression guard lives in the upsert itself: positions are stored in
/// their fixed-width textual form, so a string comparison orders them.
pub struct SqlCheckpointStore {
    pool: SqlitePool,
}

impl SqlCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint, force: bool) -> Result<()> {
        let guard = if force {
            ""
        } else {
            " WHERE excluded.position >= cdc_checkpoints.position"
        };
        let statement = format!(
            "INSERT INTO cdc_checkpoints (source_id, position, transaction_id, committed_at, metadata)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(source_id) DO UPDATE SET
                position = excluded.position,
                transaction_id = excluded.transaction_id,
                committed_at = excluded.committed_at,
                metadata = excluded.metadata{}",
            guard
        );

        let result = sqlx::query(&statement)
            .bind(&checkpoint.source_id)
            .bind(checkpoint.position.to_string())
            .bind(checkpoint.transaction_id.map(i64::from))
            .bind(to_micros(checkpoint.committed_at))
            .bind(serde_json::to_string(&checkpoint.metadata)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let stored = self.load(&checkpoint.source_id).await?.ok_or_else(|| {
                CdcError::generic(format!(
                    "Checkpoint upsert for {} affected no rows",
                    checkpoint.source_id
                ))
            })?;
            return Err(regression(&stored, checkpoint));
        }
        Ok(())
    }

    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT source_id, position, transaction_id, committed_at, metadata
             FROM cdc_checkpoints WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let position: String = row.try_get("position")?;
        let transaction_id: Option<i64> = row.try_get("transaction_id")?;
        let metadata: String = row.try_get("metadata")?;
        Ok(Some(Checkpoint {
            source_id: row.try_get("source_id")?,
            position: position.parse()?,
            transaction_id: transaction_id.and_then(|xid| u32::try_from(xid).ok()),
            committed_at: from_micros(row.try_get("committed_at")?)?,
            metadata: serde_json::from_str(&metadata)?,
        }))
    }
}
