//! Catalog collaborator
//!
//! A table is a chain of metadata versions. Every snapshot commit names the
//! snapshot it builds on; the commit fails with [`CdcError::CommitConflict`]
//! when somebody else moved the table first.

use super::object_store::ObjectStore;
use crate::error::{CdcError, Result};
use crate::types::{DataFile, PartitionSpec, Position, TableSchema};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Snapshot summary key: source that produced the snapshot
pub const SUMMARY_SOURCE_ID: &str = "cdc.source-id";
/// Snapshot summary key: highest change position contained in the snapshot
pub const SUMMARY_MAX_POSITION: &str = "cdc.max-position";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdent {
    pub namespace: String,
    pub name: String,
}

impl TableIdent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key prefix of the table under a warehouse prefix
    pub fn location(&self, warehouse_prefix: &str) -> String {
        let prefix = warehouse_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", self.namespace, self.name)
        } else {
            format!("{}/{}/{}", prefix, self.namespace, self.name)
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: i64,
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub schema_id: i32,
    pub data_files: Vec<DataFile>,
    pub summary: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub format_version: u8,
    pub table_uuid: String,
    pub location: String,
    pub last_updated_ms: i64,
    pub schemas: Vec<TableSchema>,
    pub current_schema_id: i32,
    pub partition_spec: PartitionSpec,
    pub snapshots: Vec<Snapshot>,
    pub current_snapshot_id: Option<i64>,
}

impl TableMetadata {
    pub fn new(location: String, schema: TableSchema, partition_spec: PartitionSpec) -> Self {
        Self {
            format_version: 2,
            table_uuid: uuid::Uuid::new_v4().to_string(),
            location,
            last_updated_ms: Utc::now().timestamp_millis(),
            current_schema_id: schema.schema_id,
            schemas: vec![schema],
            partition_spec,
            snapshots: Vec::new(),
            current_snapshot_id: None,
        }
    }

    pub fn current_schema(&self) -> Result<&TableSchema> {
        self.schemas
            .iter()
            .find(|s| s.schema_id == self.current_schema_id)
            .ok_or_else(|| {
                CdcError::catalog(format!(
                    "Current schema {} missing from table metadata",
                    self.current_schema_id
                ))
            })
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        let id = self.current_snapshot_id?;
        self.snapshots.iter().find(|s| s.snapshot_id == id)
    }

    /// Every data file visible in the current table state
    pub fn data_files(&self) -> impl Iterator<Item = &DataFile> {
        self.snapshots.iter().flat_map(|s| s.data_files.iter())
    }

    pub fn record_count(&self) -> u64 {
        self.data_files().map(|f| f.record_count).sum()
    }

    /// Highest position a source has committed to this table
    pub fn committed_position(&self, source_id: &str) -> Option<Position> {
        self.snapshots
            .iter()
            .filter(|s| s.summary.get(SUMMARY_SOURCE_ID).map(String::as_str) == Some(source_id))
            .filter_map(|s| s.summary.get(SUMMARY_MAX_POSITION)?.parse::<Position>().ok())
            .max()
    }

    fn apply_schema(&mut self, schema: TableSchema, table: &TableIdent) -> Result<()> {
        if schema.schema_id <= self.current_schema_id {
            return Err(CdcError::commit_conflict(
                table.to_string(),
                format!(
                    "schema {} is not newer than current schema {}",
                    schema.schema_id, self.current_schema_id
                ),
            ));
        }
        self.current_schema_id = schema.schema_id;
        self.schemas.push(schema);
        self.last_updated_ms = Utc::now().timestamp_millis();
        Ok(())
    }

    fn apply_commit(&mut self, commit: SnapshotCommit, table: &TableIdent) -> Result<i64> {
        if commit.expected_parent != self.current_snapshot_id {
            return Err(CdcError::commit_conflict(
                table.to_string(),
                format!(
                    "expected parent snapshot {:?}, table is at {:?}",
                    commit.expected_parent, self.current_snapshot_id
                ),
            ));
        }

        let snapshot_id = self
            .snapshots
            .iter()
            .map(|s| s.snapshot_id)
            .max()
            .unwrap_or(0)
            + 1;
        let mut summary = commit.summary;
        summary.insert("operation".to_string(), "append".to_string());
        summary.insert("added-data-files".to_string(), commit.data_files.len().to_string());
        summary.insert(
            "added-records".to_string(),
            commit.data_files.iter().map(|f| f.record_count).sum::<u64>().to_string(),
        );

        let now = Utc::now().timestamp_millis();
        self.snapshots.push(Snapshot {
            snapshot_id,
            parent_snapshot_id: self.current_snapshot_id,
            sequence_number: self.snapshots.len() as i64 + 1,
            timestamp_ms: now,
            schema_id: self.current_schema_id,
            data_files: commit.data_files,
            summary,
        });
        self.current_snapshot_id = Some(snapshot_id);
        self.last_updated_ms = now;
        Ok(snapshot_id)
    }
}

/// New data files to register atomically as one snapshot
#[derive(Debug, Clone, Default)]
pub struct SnapshotCommit {
    /// Snapshot the writer observed; `None` for the first commit
    pub expected_parent: Option<i64>,
    pub data_files: Vec<DataFile>,
    pub summary: BTreeMap<String, String>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn table_exists(&self, table: &TableIdent) -> Result<bool>;

    async fn load_table(&self, table: &TableIdent) -> Result<TableMetadata>;

    async fn create_table(
        &self,
        table: &TableIdent,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableMetadata>;

    /// Make `schema` (with a newer schema id) the current schema
    async fn update_schema(&self, table: &TableIdent, schema: TableSchema) -> Result<TableMetadata>;

    async fn commit_snapshot(&self, table: &TableIdent, commit: SnapshotCommit) -> Result<TableMetadata>;

    async fn close(&self) -> Result<()>;
}

fn missing_table(table: &TableIdent) -> CdcError {
    CdcError::catalog(format!("Table {} does not exist", table))
}

/// Catalog kept in process memory
pub struct MemoryCatalog {
    warehouse_prefix: String,
    tables: Mutex<HashMap<TableIdent, TableMetadata>>,
    closed: AtomicBool,
}

impl MemoryCatalog {
    pub fn new(warehouse_prefix: impl Into<String>) -> Self {
        Self {
            warehouse_prefix: warehouse_prefix.into(),
            tables: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CdcError::catalog("Catalog is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn table_exists(&self, table: &TableIdent) -> Result<bool> {
        self.check_open()?;
        Ok(self.tables.lock().await.contains_key(table))
    }

    async fn load_table(&self, table: &TableIdent) -> Result<TableMetadata> {
        self.check_open()?;
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| missing_table(table))
    }

    async fn create_table(
        &self,
        table: &TableIdent,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableMetadata> {
        self.check_open()?;
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Err(CdcError::catalog(format!("Table {} already exists", table)));
        }
        let metadata = TableMetadata::new(table.location(&self.warehouse_prefix), schema, partition_spec);
        tables.insert(table.clone(), metadata.clone());
        info!("Created table {}", table);
        Ok(metadata)
    }

    async fn update_schema(&self, table: &TableIdent, schema: TableSchema) -> Result<TableMetadata> {
        self.check_open()?;
        let mut tables = self.tables.lock().await;
        let metadata = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        metadata.apply_schema(schema, table)?;
        Ok(metadata.clone())
    }

    async fn commit_snapshot(&self, table: &TableIdent, commit: SnapshotCommit) -> Result<TableMetadata> {
        self.check_open()?;
        let mut tables = self.tables.lock().await;
        let metadata = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let snapshot_id = metadata.apply_commit(commit, table)?;
        debug!("Committed snapshot {} to {}", snapshot_id, table);
        Ok(metadata.clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Catalog persisted next to the data: `metadata/vN.metadata.json` files plus
/// a `metadata/version-hint.text` pointer, all in the object store.
pub struct ObjectStoreCatalog {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    warehouse_prefix: String,
}

impl ObjectStoreCatalog {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, warehouse_prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            warehouse_prefix: warehouse_prefix.into(),
        }
    }

    fn metadata_key(location: &str, version: u64) -> String {
        format!("{}/metadata/v{}.metadata.json", location, version)
    }

    fn hint_key(location: &str) -> String {
        format!("{}/metadata/version-hint.text", location)
    }

    /// Latest metadata version, trusting the hint only as a starting point
    async fn current_version(&self, location: &str) -> Result<Option<u64>> {
        let hinted = match self.store.download(&self.bucket, &Self::hint_key(location)).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                Some(text.trim().parse::<u64>().map_err(|e| {
                    CdcError::catalog(format!("Invalid version hint for {}: {}", location, e))
                })?)
            }
            None => None,
        };

        let mut version = match hinted {
            Some(v) => v,
            None if self.store.exists(&self.bucket, &Self::metadata_key(location, 1)).await? => 1,
            None => return Ok(None),
        };
        while self
            .store
            .exists(&self.bucket, &Self::metadata_key(location, version + 1))
            .await?
        {
            version += 1;
        }
        Ok(Some(version))
    }

    async fn load_versioned(&self, table: &TableIdent) -> Result<(u64, TableMetadata)> {
        let location = table.location(&self.warehouse_prefix);
        let version = self
            .current_version(&location)
            .await?
            .ok_or_else(|| missing_table(table))?;
        let bytes = self
            .store
            .download(&self.bucket, &Self::metadata_key(&location, version))
            .await?
            .ok_or_else(|| missing_table(table))?;
        let metadata: TableMetadata = serde_json::from_slice(&bytes).map_err(|e| {
            CdcError::catalog(format!("Corrupt metadata v{} for {}: {}", version, table, e))
        })?;
        Ok((version, metadata))
    }

    async fn write_version(&self, table: &TableIdent, version: u64, metadata: &TableMetadata) -> Result<()> {
        let location = table.location(&self.warehouse_prefix);
        let body = Bytes::from(serde_json::to_vec_pretty(metadata).map_err(|e| {
            CdcError::catalog(format!("Cannot serialize metadata for {}: {}", table, e))
        })?);
        let written = self
            .store
            .upload_if_absent(&self.bucket, &Self::metadata_key(&location, version), body)
            .await?;
        if !written {
            return Err(CdcError::commit_conflict(
                table.to_string(),
                format!("metadata version {} was written concurrently", version),
            ));
        }
        // the version file is the commit; readers step past a stale hint
        if let Err(e) = self
            .store
            .upload(
                &self.bucket,
                &Self::hint_key(&location),
                Bytes::from(version.to_string()),
            )
            .await
        {
            warn!("Committed metadata v{} for {} but could not update the version hint: {}", version, table, e);
        }
        debug!("Wrote metadata v{} for {}", version, table);
        Ok(())
    }
}

#[async_trait]
impl Catalog for ObjectStoreCatalog {
    async fn table_exists(&self, table: &TableIdent) -> Result<bool> {
        let location = table.location(&self.warehouse_prefix);
        Ok(self.current_version(&location).await?.is_some())
    }

    async fn load_table(&self, table: &TableIdent) -> Result<TableMetadata> {
        Ok(self.load_versioned(table).await?.1)
    }

    async fn create_table(
        &self,
        table: &TableIdent,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableMetadata> {
        self.store.ensure_bucket(&self.bucket).await?;
        let metadata = TableMetadata::new(table.location(&self.warehouse_prefix), schema, partition_spec);
        self.write_version(table, 1, &metadata).await.map_err(|e| match e {
            CdcError::CommitConflict { .. } => {
                CdcError::catalog(format!("Table {} already exists", table))
            }
            other => other,
        })?;
        info!("Created table {} at {}", table, metadata.location);
        Ok(metadata)
    }

    async fn update_schema(&self, table: &TableIdent, schema: TableSchema) -> Result<TableMetadata> {
        let (version, mut metadata) = self.load_versioned(table).await?;
        metadata.apply_schema(schema, table)?;
        self.write_version(table, version + 1, &metadata).await?;
        Ok(metadata)
    }

    async fn commit_snapshot(&self, table: &TableIdent, commit: SnapshotCommit) -> Result<TableMetadata> {
        let (version, mut metadata) = self.load_versioned(table).await?;
        let snapshot_id = metadata.apply_commit(commit, table)?;
        self.write_version(table, version + 1, &metadata).await?;
        debug!("Committed snapshot {} to {}", snapshot_id, table);
        Ok(metadata)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
