//! Checkpoint Manager
//!
//! One checkpoint row per source records the last position whose batch is
//! durably committed to the lake. Positions never move backwards unless a
//! save is explicitly forced (manual replay).

pub mod file;
pub mod sql;

use crate::error::{CdcError, Result};
use crate::types::{Checkpoint, Position};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use file::FileCheckpointStore;
pub use sql::SqlCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert the source's checkpoint. Without `force`, a position older than
    /// the stored one fails with [`CdcError::CheckpointRegression`].
    async fn save(&self, checkpoint: &Checkpoint, force: bool) -> Result<()>;

    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>>;
}

pub(crate) fn regression(stored: &Checkpoint, attempted: &Checkpoint) -> CdcError {
    CdcError::CheckpointRegression {
        source_id: attempted.source_id.clone(),
        stored: stored.position.to_string(),
        attempted: attempted.position.to_string(),
    }
}

/// Binds a [`CheckpointStore`] to one source
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    source_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, source_id: impl Into<String>) -> Self {
        Self {
            store,
            source_id: source_id.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn checkpoint(&self, position: Position, transaction_id: Option<u32>, metadata: serde_json::Value) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(self.source_id.clone(), position);
        checkpoint.transaction_id = transaction_id;
        checkpoint.metadata = metadata;
        checkpoint
    }

    pub async fn save(
        &self,
        position: Position,
        transaction_id: Option<u32>,
        metadata: serde_json::Value,
    ) -> Result<Checkpoint> {
        let checkpoint = self.checkpoint(position, transaction_id, metadata);
        self.store.save(&checkpoint, false).await?;
        debug!("Checkpoint for {} saved at {}", self.source_id, position);
        Ok(checkpoint)
    }

    /// Overwrite the checkpoint even if it moves backwards
    pub async fn save_forced(&self, position: Position, metadata: serde_json::Value) -> Result<Checkpoint> {
        let checkpoint = self.checkpoint(position, None, metadata);
        self.store.save(&checkpoint, true).await?;
        warn!("Checkpoint for {} forced to {}", self.source_id, position);
        Ok(checkpoint)
    }

    /// `None` on a cold start
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let checkpoint = self.store.load(&self.source_id).await?;
        match &checkpoint {
            Some(c) => info!("Loaded checkpoint for {} at {}", self.source_id, c.position),
            None => info!("No checkpoint for {}, starting from the slot's earliest position", self.source_id),
        }
        Ok(checkpoint)
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint, force: bool) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().await;
        if let Some(stored) = checkpoints.get(&checkpoint.source_id) {
            if !force && checkpoint.position < stored.position {
                return Err(regression(stored, checkpoint));
            }
        }
        checkpoints.insert(checkpoint.source_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().await.get(source_id).cloned())
    }
}
