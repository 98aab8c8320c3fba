use super::{regression, CheckpointStore};
use crate::error::Result;
use crate::types::Checkpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Metadata format version of the checkpoint file
const CHECKPOINT_FILE_VERSION: &str = "1.0";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    version: String,
    checkpoints: BTreeMap<String, Checkpoint>,
}

/// Checkpoints in a JSON file, rewritten atomically on every save
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<CheckpointFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(CheckpointFile::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &CheckpointFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json_content = serde_json::to_string_pretty(file)?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        tokio::fs::write(&temp_path, &json_content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!("Persisted checkpoints to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint, force: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if let Some(stored) = file.checkpoints.get(&checkpoint.source_id) {
            if !force && checkpoint.position < stored.position {
                return Err(regression(stored, checkpoint));
            }
        }
        if file.version != CHECKPOINT_FILE_VERSION {
            if !file.version.is_empty() {
                warn!(
                    "Upgrading checkpoint file {} from version {}",
                    self.path.display(),
                    file.version
                );
            }
            file.version = CHECKPOINT_FILE_VERSION.to_string();
        }
        file.checkpoints
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        self.write(&file).await
    }

    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.checkpoints.remove(source_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdcError;
    use crate::types::Position;

    #[tokio::test]
    async fn test_save_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");

        let store = FileCheckpointStore::new(&path);
        store
            .save(&Checkpoint::new("src", Position::new(0x40, 2)), false)
            .await
            .unwrap();
        assert!(!dir.path().join("state").join("checkpoints.json.tmp").exists());

        let reopened = FileCheckpointStore::new(&path);
        let loaded = reopened.load("src").await.unwrap().unwrap();
        assert_eq!(loaded.position, Position::new(0x40, 2));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("0000000000000040/00000002"));
    }

    #[tokio::test]
    async fn test_regression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"));
        store
            .save(&Checkpoint::new("src", Position::new(0x40, 0)), false)
            .await
            .unwrap();
        assert!(matches!(
            store
                .save(&Checkpoint::new("src", Position::new(0x30, 0)), false)
                .await
                .unwrap_err(),
            CdcError::CheckpointRegression { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("absent.json"));
        assert!(store.load("src").await.unwrap().is_none());
    }
}
