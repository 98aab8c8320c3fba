use crate::error::{CdcError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one CDC pipeline (one upstream source)
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the source; keys checkpoints, buffered events and snapshots
    pub source_id: String,

    /// Source PostgreSQL connection string (`replication=database` is added when missing)
    pub source_connection_string: String,

    /// Replication slot name to create/use
    pub replication_slot_name: String,

    /// Publication name to subscribe to
    pub publication_name: String,

    /// pgoutput protocol version (1-4). In-progress transaction streaming is never requested.
    pub protocol_version: u32,

    /// Prefix of logical decoding messages (`pg_logical_emit_message`) that announce DDL
    pub ddl_message_prefix: String,

    /// Connection timeout
    pub connection_timeout: Duration,

    /// Heartbeat interval for sending feedback to PostgreSQL
    pub heartbeat_interval: Duration,

    /// Maximum number of retry attempts for transient failures
    pub max_retry_attempts: u32,

    /// Initial retry delay (will be increased exponentially)
    pub initial_retry_delay: Duration,

    /// Maximum retry delay between attempts
    pub max_retry_delay: Duration,

    /// Retry multiplier for exponential backoff
    pub retry_multiplier: f64,

    /// Maximum total time to spend retrying before giving up
    pub max_retry_duration: Duration,

    /// Whether to add jitter to retry delays to prevent thundering herd
    pub retry_jitter: bool,

    /// sqlx SQLite URL of the buffer / checkpoint / dead-letter store
    pub buffer_url: String,

    /// Unprocessed events that make the buffer ready. Default: 1000
    pub batch_size: usize,

    /// Maximum time between two batch flushes
    pub flush_interval: Duration,

    /// Buffer depth above which the reader stops consuming upstream events
    pub buffer_max_depth: usize,

    /// How long processed events stay in the buffer before cleanup
    pub buffer_retention: Duration,

    /// Interval of buffer and dead-letter cleanup passes
    pub cleanup_interval: Duration,

    /// Encoding / malformed failures an event may cause before it is dead-lettered
    pub max_event_retries: u32,

    /// Lifetime of dead-letter records
    pub dead_letter_ttl: Duration,

    /// Root directory of the local object store
    pub warehouse_path: PathBuf,

    /// Bucket holding table data and metadata
    pub warehouse_bucket: String,

    /// Key prefix under the bucket
    pub warehouse_prefix: String,

    /// Schema mapping from PostgreSQL schema to destination namespace
    /// Maps source schema (e.g., "public") to destination namespace (e.g., "raw")
    pub schema_mappings: HashMap<String, String>,

    /// Maximum rows per parquet row group
    pub max_row_group_size: usize,

    /// Target size of one data file; rows are split across files above it
    pub target_file_size_bytes: usize,

    /// Port of the metrics / health endpoint
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_id: "pg2lake".to_string(),
            source_connection_string: String::new(),
            replication_slot_name: "pg2lake_slot".to_string(),
            publication_name: "pg2lake_pub".to_string(),
            protocol_version: 1,
            ddl_message_prefix: "pg2lake.ddl".to_string(),
            connection_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10), // Send feedback every 10 seconds to prevent 60s timeout
            max_retry_attempts: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_multiplier: 2.0,
            max_retry_duration: Duration::from_secs(300), // 5 minutes total
            retry_jitter: true,
            buffer_url: "sqlite://pg2lake_buffer.db".to_string(),
            batch_size: 1000,
            flush_interval: Duration::from_secs(10),
            buffer_max_depth: 100_000,
            buffer_retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(600),
            max_event_retries: 3,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 3600),
            warehouse_path: PathBuf::from("./warehouse"),
            warehouse_bucket: "lake".to_string(),
            warehouse_prefix: "warehouse".to_string(),
            schema_mappings: HashMap::new(),
            max_row_group_size: 128 * 1024,
            target_file_size_bytes: 128 * 1024 * 1024,
            metrics_port: 8080,
        }
    }
}

/// Builder pattern for creating configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the source identifier
    pub fn source_id<S: Into<String>>(mut self, source_id: S) -> Self {
        self.config.source_id = source_id.into();
        self
    }

    /// Set the source PostgreSQL connection string
    pub fn source_connection_string<S: Into<String>>(mut self, connection_string: S) -> Self {
        self.config.source_connection_string = connection_string.into();
        self
    }

    /// Set the replication slot name
    pub fn replication_slot_name<S: Into<String>>(mut self, slot_name: S) -> Self {
        self.config.replication_slot_name = slot_name.into();
        self
    }

    /// Set the publication name
    pub fn publication_name<S: Into<String>>(mut self, pub_name: S) -> Self {
        self.config.publication_name = pub_name.into();
        self
    }

    /// Set the protocol version (1-4)
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set the DDL logical message prefix
    pub fn ddl_message_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.ddl_message_prefix = prefix.into();
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set maximum number of retry attempts
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    /// Set initial retry delay
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.config.initial_retry_delay = delay;
        self
    }

    /// Set maximum retry delay
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    /// Set retry multiplier for exponential backoff
    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_multiplier = multiplier;
        self
    }

    /// Set maximum retry duration
    pub fn max_retry_duration(mut self, duration: Duration) -> Self {
        self.config.max_retry_duration = duration;
        self
    }

    /// Enable/disable retry jitter
    pub fn retry_jitter(mut self, enabled: bool) -> Self {
        self.config.retry_jitter = enabled;
        self
    }

    /// Set the buffer store URL
    pub fn buffer_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.buffer_url = url.into();
        self
    }

    /// Number of unprocessed events that triggers a batch
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set the backpressure ceiling
    pub fn buffer_max_depth(mut self, depth: usize) -> Self {
        self.config.buffer_max_depth = depth;
        self
    }

    /// Set processed event retention
    pub fn buffer_retention(mut self, retention: Duration) -> Self {
        self.config.buffer_retention = retention;
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Set the per-event retry budget
    pub fn max_event_retries(mut self, retries: u32) -> Self {
        self.config.max_event_retries = retries;
        self
    }

    /// Set the dead-letter record lifetime
    pub fn dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.config.dead_letter_ttl = ttl;
        self
    }

    /// Set the local warehouse root
    pub fn warehouse_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.warehouse_path = path.into();
        self
    }

    /// Set the warehouse bucket
    pub fn warehouse_bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.config.warehouse_bucket = bucket.into();
        self
    }

    /// Set the warehouse key prefix
    pub fn warehouse_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.warehouse_prefix = prefix.into();
        self
    }

    /// Add a schema mapping (maps source schema to destination namespace)
    pub fn schema_mapping<S1, S2>(mut self, source_schema: S1, namespace: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.config
            .schema_mappings
            .insert(source_schema.into(), namespace.into());
        self
    }

    /// Set all schema mappings at once
    pub fn schema_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.config.schema_mappings = mappings;
        self
    }

    /// Set the parquet row group size
    pub fn max_row_group_size(mut self, rows: usize) -> Self {
        self.config.max_row_group_size = rows;
        self
    }

    /// Set the target data file size
    pub fn target_file_size_bytes(mut self, bytes: usize) -> Self {
        self.config.target_file_size_bytes = bytes;
        self
    }

    /// Set the metrics port
    pub fn metrics_port(mut self, port: u16) -> Self {
        self.config.metrics_port = port;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_id.is_empty() {
            return Err(CdcError::config("Source id is required"));
        }

        if self.source_connection_string.is_empty() {
            return Err(CdcError::config("Source connection string is required"));
        }

        if self.replication_slot_name.is_empty() {
            return Err(CdcError::config("Replication slot name is required"));
        }

        if self.publication_name.is_empty() {
            return Err(CdcError::config("Publication name is required"));
        }

        if !(1..=4).contains(&self.protocol_version) {
            return Err(CdcError::config("Protocol version must be between 1 and 4"));
        }

        if self.buffer_url.is_empty() {
            return Err(CdcError::config("Buffer URL is required"));
        }

        if self.batch_size == 0 {
            return Err(CdcError::config("Batch size must be greater than 0"));
        }

        if self.flush_interval.is_zero() {
            return Err(CdcError::config("Flush interval must be greater than 0"));
        }

        if self.buffer_max_depth < self.batch_size {
            return Err(CdcError::config(format!(
                "Buffer max depth ({}) must be at least the batch size ({})",
                self.buffer_max_depth, self.batch_size
            )));
        }

        if self.warehouse_bucket.is_empty() {
            return Err(CdcError::config("Warehouse bucket is required"));
        }

        if self.max_row_group_size == 0 {
            return Err(CdcError::config("Row group size must be greater than 0"));
        }

        if self.retry_multiplier < 1.0 {
            return Err(CdcError::config("Retry multiplier must be at least 1.0"));
        }

        Ok(())
    }

    /// Destination namespace for a source schema
    pub fn namespace_for(&self, schema_name: &str) -> String {
        self.schema_mappings
            .get(schema_name)
            .cloned()
            .unwrap_or_else(|| schema_name.to_string())
    }
}
