//! Shared test utilities for pg2lake-lib integration tests.
//!
//! A scripted change source, failure-injecting catalog and writer wrappers,
//! and a [`Lake`] that keeps the durable state alive across simulated
//! restarts.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pg2lake_lib::buffer::{BufferConfig, SqlEventBuffer};
use pg2lake_lib::checkpoint::{CheckpointManager, SqlCheckpointStore};
use pg2lake_lib::dead_letter::MemoryDeadLetterSink;
use pg2lake_lib::error::{CdcError, Result};
use pg2lake_lib::pipeline::{Pipeline, PipelineConfig};
use pg2lake_lib::retry::RetryConfig;
use pg2lake_lib::schema::{SchemaBuilder, TypeHints};
use pg2lake_lib::source::{ChangeSource, LsnFeedback, SourceMessage};
use pg2lake_lib::store::open_sqlite_pool;
use pg2lake_lib::types::{
    BufferedEvent, ChangeEvent, ColumnValue, PartitionSpec, Position, RowData, TableSchema,
};
use pg2lake_lib::writer::{
    Catalog, EventWriter, MemoryCatalog, MemoryObjectStore, SnapshotCommit, TableIdent, TableMetadata,
    TableWriter, WriteSummary, WriterConfig,
};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const SOURCE_ID: &str = "src";
pub const BUCKET: &str = "lake";
pub const PREFIX: &str = "warehouse";

pub fn row(pairs: &[(&str, ColumnValue)]) -> RowData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn at(lsn: u64) -> Position {
    Position::new(lsn, 0)
}

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn insert(table: &str, position: Position, after: RowData) -> SourceMessage {
    SourceMessage::Change(
        ChangeEvent::insert(SOURCE_ID, "public", table, position, after)
            .with_transaction(position.commit_lsn as u32)
            .with_event_time(day(2024, 3, 1)),
    )
}

pub fn delete(table: &str, position: Position, before: RowData) -> SourceMessage {
    SourceMessage::Change(
        ChangeEvent::delete(SOURCE_ID, "public", table, position, before)
            .with_transaction(position.commit_lsn as u32)
            .with_event_time(day(2024, 3, 1)),
    )
}

/// What a [`ScriptedSource`] saw, readable after it moved into a pipeline
#[derive(Default)]
pub struct SourceLog {
    pub starts: Mutex<Vec<Option<Position>>>,
    pub delivered: AtomicUsize,
    pub keepalives: AtomicUsize,
    pub stopped: AtomicBool,
}

impl SourceLog {
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<Option<Position>> {
        self.starts.lock().unwrap().clone()
    }
}

/// Replays a fixed list of messages, then idles until cancelled
pub struct ScriptedSource {
    script: VecDeque<SourceMessage>,
    start_error: Option<CdcError>,
    log: Arc<SourceLog>,
}

impl ScriptedSource {
    pub fn new(script: Vec<SourceMessage>) -> (Self, Arc<SourceLog>) {
        let log = Arc::new(SourceLog::default());
        (
            Self {
                script: script.into(),
                start_error: None,
                log: log.clone(),
            },
            log,
        )
    }

    pub fn failing_start(error: CdcError) -> (Self, Arc<SourceLog>) {
        let (mut source, log) = Self::new(Vec::new());
        source.start_error = Some(error);
        (source, log)
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn start(&mut self, start: Option<Position>) -> Result<()> {
        self.log.starts.lock().unwrap().push(start);
        match self.start_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<SourceMessage>> {
        match self.script.pop_front() {
            Some(message) => {
                self.log.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(Some(message))
            }
            None => {
                cancel.cancelled().await;
                Ok(None)
            }
        }
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.log.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Catalog wrapper that rejects snapshot commits once its allowance is used up.
///
/// `close` leaves the inner catalog open so it can serve the next run.
pub struct FlakyCatalog {
    inner: Arc<dyn Catalog>,
    commits_allowed: AtomicUsize,
    report_failure_after_commit: bool,
}

impl FlakyCatalog {
    pub fn new(inner: Arc<dyn Catalog>, commits_allowed: usize) -> Self {
        Self {
            inner,
            commits_allowed: AtomicUsize::new(commits_allowed),
            report_failure_after_commit: false,
        }
    }

    pub fn reliable(inner: Arc<dyn Catalog>) -> Self {
        Self::new(inner, usize::MAX)
    }

    /// Every commit reaches the inner catalog, then reports a transient error
    pub fn lost_acknowledgements(inner: Arc<dyn Catalog>) -> Self {
        Self {
            report_failure_after_commit: true,
            ..Self::reliable(inner)
        }
    }
}

#[async_trait]
impl Catalog for FlakyCatalog {
    async fn table_exists(&self, table: &TableIdent) -> Result<bool> {
        self.inner.table_exists(table).await
    }

    async fn load_table(&self, table: &TableIdent) -> Result<TableMetadata> {
        self.inner.load_table(table).await
    }

    async fn create_table(
        &self,
        table: &TableIdent,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableMetadata> {
        self.inner.create_table(table, schema, partition_spec).await
    }

    async fn update_schema(&self, table: &TableIdent, schema: TableSchema) -> Result<TableMetadata> {
        self.inner.update_schema(table, schema).await
    }

    async fn commit_snapshot(&self, table: &TableIdent, commit: SnapshotCommit) -> Result<TableMetadata> {
        let allowed = self
            .commits_allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if allowed.is_err() {
            return Err(CdcError::catalog(format!("injected commit failure for {}", table)));
        }
        let committed = self.inner.commit_snapshot(table, commit).await?;
        if self.report_failure_after_commit {
            return Err(CdcError::object_store(format!(
                "connection reset after committing to {}",
                table
            )));
        }
        Ok(committed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writer that refuses any batch containing a row with a `poison` column
pub struct PoisonWriter {
    inner: Arc<dyn EventWriter>,
}

impl PoisonWriter {
    pub fn new(inner: Arc<dyn EventWriter>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventWriter for PoisonWriter {
    async fn write_events(&self, batch: &[BufferedEvent]) -> Result<WriteSummary> {
        let poisoned = batch.iter().find(|b| {
            b.event
                .row_image()
                .is_some_and(|row| row.contains_key("poison"))
        });
        if let Some(bad) = poisoned {
            return Err(CdcError::encoding(format!(
                "cannot encode event at {}",
                bad.event.position
            )));
        }
        self.inner.write_events(batch).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Writer that announces each write and holds it until released
pub struct GatedWriter {
    inner: Arc<dyn EventWriter>,
    pub started: Notify,
    pub release: Notify,
}

impl GatedWriter {
    pub fn new(inner: Arc<dyn EventWriter>) -> Self {
        Self {
            inner,
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl EventWriter for GatedWriter {
    async fn write_events(&self, batch: &[BufferedEvent]) -> Result<WriteSummary> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.write_events(batch).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub fn writer_config() -> WriterConfig {
    WriterConfig {
        source_id: SOURCE_ID.to_string(),
        bucket: BUCKET.to_string(),
        warehouse_prefix: PREFIX.to_string(),
        schema_mappings: HashMap::new(),
        max_row_group_size: 1024,
        target_file_size_bytes: 64 * 1024 * 1024,
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        source_id: SOURCE_ID.to_string(),
        flush_interval: Duration::from_secs(3600),
        buffer_max_depth: 10_000,
        buffer_retention: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        max_event_retries: 3,
        dead_letter_ttl: Duration::from_secs(3600),
        retry: RetryConfig::immediate(3),
    }
}

/// Durable state shared by consecutive pipeline runs
pub struct Lake {
    pub pool: SqlitePool,
    pub catalog: Arc<MemoryCatalog>,
    pub store: Arc<MemoryObjectStore>,
    pub dead_letters: Arc<MemoryDeadLetterSink>,
}

/// One pipeline run over a [`Lake`]
pub struct Run {
    pub pipeline: Pipeline,
    pub buffer: Arc<SqlEventBuffer>,
    pub checkpoints: CheckpointManager,
    pub feedback: Arc<LsnFeedback>,
}

impl Lake {
    pub async fn new() -> Self {
        Self {
            pool: open_sqlite_pool("sqlite::memory:").await.unwrap(),
            catalog: Arc::new(MemoryCatalog::new(PREFIX)),
            store: Arc::new(MemoryObjectStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
        }
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(Arc::new(SqlCheckpointStore::new(self.pool.clone())), SOURCE_ID)
    }

    pub fn table_writer(&self, catalog: Arc<dyn Catalog>) -> Arc<TableWriter> {
        Arc::new(TableWriter::new(
            writer_config(),
            catalog,
            self.store.clone(),
            SchemaBuilder::default(),
        ))
    }

    /// Build a pipeline as a fresh process would: new buffer handle and
    /// writer cache over the same durable state
    pub async fn run(
        &self,
        config: PipelineConfig,
        batch_size: usize,
        source: ScriptedSource,
        writer: Arc<dyn EventWriter>,
    ) -> Run {
        let buffer = Arc::new(
            SqlEventBuffer::new(
                self.pool.clone(),
                BufferConfig {
                    source_id: SOURCE_ID.to_string(),
                    batch_size,
                    flush_interval: config.flush_interval,
                },
            )
            .await
            .unwrap(),
        );
        let checkpoints = self.checkpoints();
        let feedback = Arc::new(LsnFeedback::new());
        let pipeline = Pipeline::builder(config)
            .source(Box::new(source))
            .buffer(buffer.clone())
            .checkpoints(checkpoints.clone())
            .writer(writer)
            .dead_letters(self.dead_letters.clone())
            .type_hints(Arc::new(TypeHints::new()))
            .feedback(feedback.clone())
            .build()
            .unwrap();
        Run {
            pipeline,
            buffer,
            checkpoints,
            feedback,
        }
    }

    pub async fn table(&self, name: &str) -> TableMetadata {
        self.catalog
            .load_table(&TableIdent::new("public", name))
            .await
            .unwrap()
    }

    pub async fn buffered_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM cdc_events")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

/// Poll `condition` every few milliseconds, panicking after five seconds
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn checkpoint_position(checkpoints: &CheckpointManager) -> Option<Position> {
    checkpoints.load().await.unwrap().map(|c| c.position)
}
