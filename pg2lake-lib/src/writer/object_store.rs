//! Object store collaborator
//!
//! Keys are `/`-separated paths inside a bucket. Uploads become visible
//! atomically: readers see either the previous object or the complete new one.

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;

    async fn upload(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    /// Upload only if `key` does not exist yet; returns whether it was written
    async fn upload_if_absent(&self, bucket: &str, key: &str, data: Bytes) -> Result<bool>;

    /// `None` when the object does not exist
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Keys under `prefix`, sorted
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    if key.is_empty()
        || path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(CdcError::config(format!("Invalid object key '{}'", key)));
    }
    Ok(())
}

/// Buckets as directories under a root path
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        validate_key(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_path(bucket)?.join(key))
    }

    async fn stage(&self, path: &Path, data: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, data).await?;
        Ok(temp)
    }
}

fn not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_path(bucket)?).await?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let temp = self.stage(&path, &data).await?;
        tokio::fs::rename(&temp, &path).await?;
        debug!("Uploaded {} bytes to {}/{}", data.len(), bucket, key);
        Ok(())
    }

    async fn upload_if_absent(&self, bucket: &str, key: &str, data: Bytes) -> Result<bool> {
        let path = self.object_path(bucket, key)?;
        let temp = self.stage(&path, &data).await?;
        // hard_link refuses to replace an existing file
        let linked = tokio::fs::hard_link(&temp, &path).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.object_path(bucket, key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(bucket, key)?).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(bucket, key)?).await?)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.bucket_path(bucket)?;
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if not_found(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.contains(".tmp-") {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        self.inner.lock().await.buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        if !inner.buckets.contains(bucket) {
            return Err(CdcError::object_store(format!("Bucket {} does not exist", bucket)));
        }
        inner.objects.insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn upload_if_absent(&self, bucket: &str, key: &str, data: Bytes) -> Result<bool> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        if !inner.buckets.contains(bucket) {
            return Err(CdcError::object_store(format!("Bucket {} does not exist", bucket)));
        }
        let slot = (bucket.to_string(), key.to_string());
        if inner.objects.contains_key(&slot) {
            return Ok(false);
        }
        inner.objects.insert(slot, data);
        Ok(true)
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .objects
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ObjectStore) {
        store.ensure_bucket("lake").await.unwrap();
        store
            .upload("lake", "wh/ns/t/data/a.parquet", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert!(store.exists("lake", "wh/ns/t/data/a.parquet").await.unwrap());
        assert_eq!(
            store.download("lake", "wh/ns/t/data/a.parquet").await.unwrap().unwrap(),
            Bytes::from_static(b"abc")
        );
        assert!(store.download("lake", "wh/missing").await.unwrap().is_none());

        assert!(store
            .upload_if_absent("lake", "wh/ns/t/metadata/v1.metadata.json", Bytes::from_static(b"1"))
            .await
            .unwrap());
        assert!(!store
            .upload_if_absent("lake", "wh/ns/t/metadata/v1.metadata.json", Bytes::from_static(b"2"))
            .await
            .unwrap());
        assert_eq!(
            store
                .download("lake", "wh/ns/t/metadata/v1.metadata.json")
                .await
                .unwrap()
                .unwrap(),
            Bytes::from_static(b"1")
        );

        assert_eq!(
            store.list("lake", "wh/ns/t/").await.unwrap(),
            vec!["wh/ns/t/data/a.parquet", "wh/ns/t/metadata/v1.metadata.json"]
        );

        store.delete("lake", "wh/ns/t/data/a.parquet").await.unwrap();
        store.delete("lake", "wh/ns/t/data/a.parquet").await.unwrap();
        assert!(!store.exists("lake", "wh/ns/t/data/a.parquet").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryObjectStore::new()).await;
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_the_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.ensure_bucket("lake").await.unwrap();
        assert!(store
            .upload("lake", "../outside", Bytes::from_static(b"x"))
            .await
            .is_err());
        assert!(store
            .upload("lake", "/etc/passwd", Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
