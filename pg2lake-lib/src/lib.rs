//! # PostgreSQL to Lake CDC Library
//!
//! Streams row-level changes from PostgreSQL logical replication into
//! versioned, day-partitioned parquet tables.
//!
//! ## Features
//!
//! - pgoutput decoding with transaction-scoped, replay-stable positions
//! - Durable SQLite buffer between capture and write, with backpressure
//! - Monotonic per-source checkpoints that advance only after a catalog commit
//! - Schema inference and evolution with stable field ids
//! - Atomic snapshot commits; uploaded files are removed when a commit fails
//! - Dead-letter sink for events that exhaust their retry budget
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pg2lake_lib::{load_config_from_env, run_cdc_app};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config_from_env()?;
//!     run_cdc_app(config, env!("CARGO_PKG_VERSION")).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod app;
pub mod config;
pub mod env;
pub mod error;
pub mod retry;
pub mod types;

// Change capture
pub mod source;

// Persistence shared by buffer, checkpoints and dead letters
pub mod store;
pub mod buffer;
pub mod checkpoint;
pub mod dead_letter;

// Lake side
pub mod schema;
pub mod writer;

pub mod pipeline;

// Monitoring and metrics
pub mod monitoring;

// Public API exports
pub use app::{run_cdc_app, CdcApp, CdcAppConfig};
pub use buffer::{BufferConfig, EventBuffer, MemoryEventBuffer, SqlEventBuffer};
pub use checkpoint::{
    CheckpointManager, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, SqlCheckpointStore,
};
pub use config::{Config, ConfigBuilder};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink, MemoryDeadLetterSink, SqlDeadLetterSink};
pub use env::load_config_from_env;
pub use error::{CdcError, ErrorKind};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PipelineHandle, PipelineState, PipelineStatus};
pub use retry::{retry_transient, RetryConfig};
pub use schema::{SchemaBuilder, TypeHints};
pub use source::{ChangeSource, LsnFeedback, SchemaChangeNotice, SourceMessage};
pub use types::{
    format_lsn, parse_lsn, BufferedEvent, ChangeEvent, Checkpoint, ColumnValue, DataFile, Lsn, Operation,
    Position, RowData, TableSchema,
};
pub use writer::{Catalog, EventWriter, ObjectStore, TableWriter, WriteSummary, WriterConfig};

pub type CdcResult<T> = Result<T, CdcError>;

// Always export metrics abstraction layer
pub use crate::monitoring::{default_collector, MetricsCollectorTrait, NoopMetrics, ProcessingTimer};

// Conditionally export metrics server functionality
#[cfg(feature = "metrics")]
pub use crate::monitoring::{MetricsServer, MetricsServerConfig, PrometheusMetrics};
