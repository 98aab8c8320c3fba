//! Table Writer
//!
//! Turns a drained buffer batch into parquet files and registers them as one
//! catalog snapshot per destination table.

pub mod catalog;
pub mod encoder;
pub mod object_store;
pub mod partition;

pub use catalog::{
    Catalog, MemoryCatalog, ObjectStoreCatalog, Snapshot, SnapshotCommit, TableIdent, TableMetadata,
    SUMMARY_MAX_POSITION, SUMMARY_SOURCE_ID,
};
pub use encoder::{EncodedFile, ParquetEncoder};
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore};

use crate::config::Config;
use crate::error::{CdcError, Result};
use crate::schema::{SchemaBuilder, CDC_TIMESTAMP_COLUMN};
use crate::types::{BufferedEvent, ChangeEvent, DataFile, FileFormat, PartitionSpec, Position};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Destination of drained batches
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Write and commit `batch`. Either every table in the batch ends up
    /// committed or an error is returned; tables committed before the error
    /// are recognised on retry through their commit watermark.
    async fn write_events(&self, batch: &[BufferedEvent]) -> Result<WriteSummary>;

    async fn close(&self) -> Result<()>;
}

/// What one `write_events` call did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub tables_committed: usize,
    pub files_written: usize,
    pub records_written: u64,
    /// Events at or below a table's commit watermark
    pub events_skipped: u64,
    pub max_position: Option<Position>,
}

impl WriteSummary {
    fn absorb(&mut self, other: WriteSummary) {
        self.tables_committed += other.tables_committed;
        self.files_written += other.files_written;
        self.records_written += other.records_written;
        self.events_skipped += other.events_skipped;
        self.max_position = self.max_position.max(other.max_position);
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub source_id: String,
    pub bucket: String,
    pub warehouse_prefix: String,
    pub schema_mappings: HashMap<String, String>,
    pub max_row_group_size: usize,
    pub target_file_size_bytes: usize,
}

impl From<&Config> for WriterConfig {
    fn from(config: &Config) -> Self {
        Self {
            source_id: config.source_id.clone(),
            bucket: config.warehouse_bucket.clone(),
            warehouse_prefix: config.warehouse_prefix.clone(),
            schema_mappings: config.schema_mappings.clone(),
            max_row_group_size: config.max_row_group_size,
            target_file_size_bytes: config.target_file_size_bytes,
        }
    }
}

impl WriterConfig {
    pub fn table_for(&self, event: &ChangeEvent) -> TableIdent {
        let namespace = self
            .schema_mappings
            .get(&event.schema_name)
            .cloned()
            .unwrap_or_else(|| event.schema_name.clone());
        TableIdent::new(namespace, event.table_name.clone())
    }
}

/// Writer over a catalog and an object store
pub struct TableWriter {
    config: WriterConfig,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ObjectStore>,
    schema_builder: SchemaBuilder,
    encoder: ParquetEncoder,
    /// Table state last seen by this writer; the lock also serializes commits
    tables: Mutex<HashMap<TableIdent, TableMetadata>>,
    bucket_ready: AtomicBool,
}

impl TableWriter {
    pub fn new(
        config: WriterConfig,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn ObjectStore>,
        schema_builder: SchemaBuilder,
    ) -> Self {
        let encoder = ParquetEncoder::new(config.max_row_group_size);
        Self {
            config,
            catalog,
            store,
            schema_builder,
            encoder,
            tables: Mutex::new(HashMap::new()),
            bucket_ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    async fn ensure_bucket(&self) -> Result<()> {
        if !self.bucket_ready.load(Ordering::Acquire) {
            self.store.ensure_bucket(&self.config.bucket).await?;
            self.bucket_ready.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Cached metadata, or the catalog's, creating the table when absent
    async fn resolve_table(
        &self,
        cache: &mut HashMap<TableIdent, TableMetadata>,
        table: &TableIdent,
        events: &[&ChangeEvent],
    ) -> Result<TableMetadata> {
        if let Some(metadata) = cache.get(table) {
            return Ok(metadata.clone());
        }

        let metadata = if self.catalog.table_exists(table).await? {
            debug!("Loading table {}", table);
            self.catalog.load_table(table).await?
        } else {
            let schema = self.schema_builder.build_schema(events.iter().copied());
            let spec = PartitionSpec::day(&schema, CDC_TIMESTAMP_COLUMN)?;
            info!(
                "Creating table {} with columns {:?}",
                table,
                schema.field_names()
            );
            self.catalog.create_table(table, schema, spec).await?
        };
        cache.insert(table.clone(), metadata.clone());
        Ok(metadata)
    }

    /// Encode events, halving any file that comes out above the size target
    fn encode_bounded<'a>(
        &self,
        schema: &crate::types::TableSchema,
        events: &[&'a ChangeEvent],
    ) -> Result<Vec<EncodedFile>> {
        let mut files = Vec::new();
        let mut pending: Vec<&[&'a ChangeEvent]> = vec![events];
        while let Some(chunk) = pending.pop() {
            let encoded = self.encoder.encode(schema, chunk)?;
            if encoded.bytes.len() > self.config.target_file_size_bytes && chunk.len() > 1 {
                let (left, right) = chunk.split_at(chunk.len() / 2);
                // right first so files come out in position order
                pending.push(right);
                pending.push(left);
                continue;
            }
            files.push(encoded);
        }
        Ok(files)
    }

    async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.store.delete(&self.config.bucket, key).await {
                warn!("Failed to delete uncommitted object {}: {}", key, e);
            }
        }
    }

    /// One attempt at writing `events` into `table` on top of `metadata`
    async fn commit_table(
        &self,
        table: &TableIdent,
        metadata: TableMetadata,
        events: &[&ChangeEvent],
    ) -> Result<(TableMetadata, WriteSummary)> {
        let mut summary = WriteSummary::default();

        let watermark = metadata.committed_position(&self.config.source_id);
        let fresh: Vec<&ChangeEvent> = events
            .iter()
            .copied()
            .filter(|e| watermark.map_or(true, |w| e.position > w))
            .collect();
        summary.events_skipped = (events.len() - fresh.len()) as u64;
        if fresh.is_empty() {
            debug!(
                "All {} events for {} are at or below watermark {:?}",
                events.len(),
                table,
                watermark.map(|w| w.to_string())
            );
            return Ok((metadata, summary));
        }

        let mut metadata = metadata;
        let current = metadata.current_schema()?.clone();
        let candidate = self.schema_builder.build_schema(fresh.iter().copied());
        let merged = self.schema_builder.merge_schemas(&current, &candidate);
        if merged.schema_id != current.schema_id {
            info!("Evolving schema of {} to version {}", table, merged.schema_id);
            metadata = self.catalog.update_schema(table, merged).await?;
        }
        let schema = metadata.current_schema()?.clone();
        let spec = metadata.partition_spec.clone();

        let mut uploaded: Vec<String> = Vec::new();
        let mut data_files: Vec<DataFile> = Vec::new();
        let result: Result<TableMetadata> = async {
            for (day, day_events) in partition::split_by_day(&fresh) {
                let partition_path = partition::partition_path(&spec, day);
                for encoded in self.encode_bounded(&schema, &day_events)? {
                    let key = match &partition_path {
                        Some(p) => format!("{}/data/{}/{}.parquet", metadata.location, p, uuid::Uuid::new_v4()),
                        None => format!("{}/data/{}.parquet", metadata.location, uuid::Uuid::new_v4()),
                    };
                    let size_bytes = encoded.bytes.len() as u64;
                    self.store
                        .upload(&self.config.bucket, &key, encoded.bytes)
                        .await?;
                    uploaded.push(key.clone());
                    data_files.push(DataFile {
                        file_path: key,
                        format: FileFormat::Parquet,
                        record_count: encoded.record_count,
                        size_bytes,
                        partition_data: partition::partition_data(&spec, day),
                    });
                }
            }

            let max_position = fresh.iter().map(|e| e.position).max();
            let min_position = fresh.iter().map(|e| e.position).min();
            let mut snapshot_summary = BTreeMap::from([(
                SUMMARY_SOURCE_ID.to_string(),
                self.config.source_id.clone(),
            )]);
            if let Some(max) = max_position {
                snapshot_summary.insert(SUMMARY_MAX_POSITION.to_string(), max.to_string());
            }
            if let Some(min) = min_position {
                snapshot_summary.insert("cdc.min-position".to_string(), min.to_string());
            }

            self.catalog
                .commit_snapshot(
                    table,
                    SnapshotCommit {
                        expected_parent: metadata.current_snapshot_id,
                        data_files: data_files.clone(),
                        summary: snapshot_summary,
                    },
                )
                .await
        }
        .await;

        let committed = match result {
            Ok(committed) => committed,
            Err(e) => match self.landed_despite(table, &uploaded, &e).await {
                Some(committed) => committed,
                None => return Err(e),
            },
        };
        summary.tables_committed = 1;
        summary.files_written = data_files.len();
        summary.records_written = data_files.iter().map(|f| f.record_count).sum();
        summary.max_position = fresh.iter().map(|e| e.position).max();
        Ok((committed, summary))
    }

    /// Settle a commit that reported `error` after `uploaded` went up.
    ///
    /// The catalog may have recorded the snapshot before failing, so the
    /// table is reloaded first: if it references the uploads the commit
    /// stands and the reloaded metadata is returned. Uploads are deleted
    /// only once the table is known not to reference them.
    async fn landed_despite(
        &self,
        table: &TableIdent,
        uploaded: &[String],
        error: &CdcError,
    ) -> Option<TableMetadata> {
        let first = uploaded.first()?;
        if !matches!(error, CdcError::CommitConflict { .. }) {
            match self.catalog.load_table(table).await {
                Ok(reloaded) if reloaded.data_files().any(|f| &f.file_path == first) => {
                    warn!("Commit to {} reported an error but the snapshot landed: {}", table, error);
                    return Some(reloaded);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Cannot tell whether the commit to {} landed ({}); keeping {} uploaded files",
                        table,
                        e,
                        uploaded.len()
                    );
                    return None;
                }
            }
        }
        self.discard(uploaded).await;
        None
    }

    async fn write_table(
        &self,
        cache: &mut HashMap<TableIdent, TableMetadata>,
        table: &TableIdent,
        events: &[&ChangeEvent],
    ) -> Result<WriteSummary> {
        let metadata = self.resolve_table(cache, table, events).await?;
        match self.commit_table(table, metadata, events).await {
            Ok((committed, summary)) => {
                cache.insert(table.clone(), committed);
                Ok(summary)
            }
            Err(e @ CdcError::CommitConflict { .. }) => {
                warn!("{}; reloading {} and retrying once", e, table);
                cache.remove(table);
                let reloaded = self.catalog.load_table(table).await?;
                let (committed, summary) = self.commit_table(table, reloaded, events).await?;
                cache.insert(table.clone(), committed);
                Ok(summary)
            }
            Err(e) => {
                cache.remove(table);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventWriter for TableWriter {
    async fn write_events(&self, batch: &[BufferedEvent]) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }
        self.ensure_bucket().await?;

        let mut grouped: BTreeMap<TableIdent, Vec<&ChangeEvent>> = BTreeMap::new();
        for buffered in batch {
            grouped
                .entry(self.config.table_for(&buffered.event))
                .or_default()
                .push(&buffered.event);
        }

        let mut cache = self.tables.lock().await;
        for (table, events) in &grouped {
            let table_summary = self.write_table(&mut cache, table, events).await?;
            debug!(
                "Table {}: {} records in {} files, {} skipped",
                table, table_summary.records_written, table_summary.files_written, table_summary.events_skipped
            );
            summary.absorb(table_summary);
        }

        info!(
            "Wrote {} records to {} tables ({} files)",
            summary.records_written, summary.tables_committed, summary.files_written
        );
        Ok(summary)
    }

    async fn close(&self) -> Result<()> {
        self.catalog.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnValue, RowData};
    use chrono::{TimeZone, Utc};

    fn config() -> WriterConfig {
        WriterConfig {
            source_id: "src".to_string(),
            bucket: "lake".to_string(),
            warehouse_prefix: "wh".to_string(),
            schema_mappings: HashMap::from([("public".to_string(), "raw".to_string())]),
            max_row_group_size: 1024,
            target_file_size_bytes: 128 * 1024 * 1024,
        }
    }

    fn row(pairs: &[(&str, ColumnValue)]) -> RowData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn buffered(id: i64, event: ChangeEvent) -> BufferedEvent {
        BufferedEvent {
            id,
            event,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    fn insert(table: &str, seq: u32, data: RowData) -> ChangeEvent {
        ChangeEvent::insert("src", "public", table, Position::new(0x10, seq), data)
            .with_event_time(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn writer(catalog: Arc<dyn Catalog>, store: Arc<dyn ObjectStore>) -> TableWriter {
        TableWriter::new(config(), catalog, store, SchemaBuilder::default())
    }

    #[tokio::test]
    async fn test_writes_one_snapshot_per_table() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let store = Arc::new(MemoryObjectStore::new());
        let writer = writer(catalog.clone(), store.clone());

        let batch = vec![
            buffered(1, insert("users", 0, row(&[("id", 1.into())]))),
            buffered(2, insert("orders", 1, row(&[("id", 7.into())]))),
            buffered(3, insert("users", 2, row(&[("id", 2.into())]))),
        ];
        let summary = writer.write_events(&batch).await.unwrap();
        assert_eq!(summary.tables_committed, 2);
        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.max_position, Some(Position::new(0x10, 2)));

        let users = catalog.load_table(&TableIdent::new("raw", "users")).await.unwrap();
        assert_eq!(users.snapshots.len(), 1);
        let file = users.data_files().next().unwrap();
        assert!(file
            .file_path
            .starts_with("wh/raw/users/data/_cdc_timestamp_day=2024-03-01/"));
        assert_eq!(file.record_count, 2);
        assert!(store.exists("lake", &file.file_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_replayed_events_are_skipped_by_watermark() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let store = Arc::new(MemoryObjectStore::new());
        let writer = writer(catalog.clone(), store.clone());
        let batch = vec![buffered(1, insert("users", 0, row(&[("id", 1.into())])))];

        writer.write_events(&batch).await.unwrap();
        let replay = writer.write_events(&batch).await.unwrap();
        assert_eq!(replay.events_skipped, 1);
        assert_eq!(replay.tables_committed, 0);

        let users = catalog.load_table(&TableIdent::new("raw", "users")).await.unwrap();
        assert_eq!(users.snapshots.len(), 1);
        assert_eq!(store.list("lake", "wh/raw/users/data/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_columns_evolve_the_table() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let writer = writer(catalog.clone(), Arc::new(MemoryObjectStore::new()));

        writer
            .write_events(&[buffered(1, insert("users", 0, row(&[("id", 1.into()), ("name", "a".into())])))])
            .await
            .unwrap();
        writer
            .write_events(&[buffered(2, insert("users", 1, row(&[("id", 2.into()), ("age", 30.into())])))])
            .await
            .unwrap();

        let users = catalog.load_table(&TableIdent::new("raw", "users")).await.unwrap();
        let schema = users.current_schema().unwrap();
        assert_eq!(schema.schema_id, 1);
        assert_eq!(schema.field("id").unwrap().id, 1);
        assert_eq!(schema.field("name").unwrap().id, 2);
        assert_eq!(schema.field("age").unwrap().id, 6);
    }

    #[tokio::test]
    async fn test_events_split_across_days() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let writer = writer(catalog.clone(), Arc::new(MemoryObjectStore::new()));
        let next_day = insert("users", 1, row(&[("id", 2.into())]))
            .with_event_time(Utc.with_ymd_and_hms(2024, 3, 2, 0, 30, 0).unwrap());

        let summary = writer
            .write_events(&[buffered(1, insert("users", 0, row(&[("id", 1.into())]))), buffered(2, next_day)])
            .await
            .unwrap();
        assert_eq!(summary.files_written, 2);

        let users = catalog.load_table(&TableIdent::new("raw", "users")).await.unwrap();
        let days: Vec<_> = users
            .data_files()
            .map(|f| f.partition_data["_cdc_timestamp_day"].clone())
            .collect();
        assert_eq!(days, vec![serde_json::json!("2024-03-01"), serde_json::json!("2024-03-02")]);
    }

    #[tokio::test]
    async fn test_oversized_files_are_split() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let mut config = config();
        config.target_file_size_bytes = 1;
        let writer = TableWriter::new(
            config,
            catalog.clone(),
            Arc::new(MemoryObjectStore::new()),
            SchemaBuilder::default(),
        );
        let batch: Vec<BufferedEvent> = (0..4)
            .map(|i| buffered(i as i64, insert("users", i, row(&[("id", (i as i64).into())]))))
            .collect();

        let summary = writer.write_events(&batch).await.unwrap();
        assert_eq!(summary.files_written, 4);
        assert_eq!(summary.records_written, 4);
    }

    #[tokio::test]
    async fn test_stale_cache_is_reloaded_on_conflict() {
        let catalog = Arc::new(MemoryCatalog::new("wh"));
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let first = writer(catalog.clone(), store.clone());
        let second = writer(catalog.clone(), store.clone());

        first
            .write_events(&[buffered(1, insert("users", 0, row(&[("id", 1.into())])))])
            .await
            .unwrap();
        second
            .write_events(&[buffered(2, insert("users", 1, row(&[("id", 2.into())])))])
            .await
            .unwrap();
        // first still caches the table without second's snapshot
        let summary = first
            .write_events(&[buffered(3, insert("users", 2, row(&[("id", 3.into())])))])
            .await
            .unwrap();
        assert_eq!(summary.tables_committed, 1);

        let users = catalog.load_table(&TableIdent::new("raw", "users")).await.unwrap();
        assert_eq!(users.snapshots.len(), 3);
        assert_eq!(users.record_count(), 3);
    }
}
