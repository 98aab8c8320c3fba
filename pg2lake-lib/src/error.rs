use std::fmt;
use thiserror::Error;

/// Error classes the pipeline branches on.
///
/// Every [`CdcError`] maps onto exactly one kind; retry loops, the batch
/// scheduler and the state machine decide what to do from the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network drop, lock timeout, unavailable store. Retried with backoff.
    Transient,
    /// A single event cannot be parsed or decoded. Skipped and logged.
    MalformedEvent,
    /// A batch cannot be serialized into the columnar format.
    Encoding,
    /// Checkpoint regression or unexpected catalog conflict.
    Consistency,
    /// Authentication failure, missing publication/table, exhausted retries.
    Unrecoverable,
    /// The surrounding operation was cancelled.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::MalformedEvent => "malformed_event",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Unrecoverable => "unrecoverable",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error types for CDC pipeline operations
#[derive(Error, Debug)]
pub enum CdcError {
    /// Upstream connection errors (replication transport, admin connection)
    #[error("Connection error: {0}")]
    Connection(String),

    /// PostgreSQL admin connection errors
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Buffer / checkpoint / dead-letter store errors
    #[error("Store error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replication slot errors
    #[error("Replication slot error: {0}")]
    ReplicationSlot(String),

    /// Publication errors
    #[error("Publication error: {0}")]
    Publication(String),

    /// Protocol parsing errors
    #[error("Protocol parsing error: {0}")]
    Protocol(String),

    /// A single change event could not be decoded
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Buffer operation errors
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Columnar encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Arrow array construction errors
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet writer/reader errors
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Catalog errors (missing table, malformed metadata)
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Another writer committed first
    #[error("Catalog commit conflict on {table}: {message}")]
    CommitConflict { table: String, message: String },

    /// A checkpoint write would move the position backwards
    #[error("Checkpoint regression for source {source_id}: stored {stored}, attempted {attempted}")]
    CheckpointRegression {
        source_id: String,
        stored: String,
        attempted: String,
    },

    /// Generic errors
    #[error("CDC error: {0}")]
    Generic(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Retry budget exhausted
    #[error("Retries exhausted: {0}")]
    RetryExhausted(String),

    /// Operation cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl CdcError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CdcError::Config(msg.into())
    }

    /// Create a new replication slot error
    pub fn replication_slot<S: Into<String>>(msg: S) -> Self {
        CdcError::ReplicationSlot(msg.into())
    }

    /// Create a new publication error
    pub fn publication<S: Into<String>>(msg: S) -> Self {
        CdcError::Publication(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        CdcError::Protocol(msg.into())
    }

    /// Create a new malformed event error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        CdcError::MalformedEvent(msg.into())
    }

    /// Create a new buffer error
    pub fn buffer<S: Into<String>>(msg: S) -> Self {
        CdcError::Buffer(msg.into())
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        CdcError::Connection(msg.into())
    }

    /// Create a new encoding error
    pub fn encoding<S: Into<String>>(msg: S) -> Self {
        CdcError::Encoding(msg.into())
    }

    /// Create a new object store error
    pub fn object_store<S: Into<String>>(msg: S) -> Self {
        CdcError::ObjectStore(msg.into())
    }

    /// Create a new catalog error
    pub fn catalog<S: Into<String>>(msg: S) -> Self {
        CdcError::Catalog(msg.into())
    }

    /// Create a new commit conflict error
    pub fn commit_conflict<T: Into<String>, S: Into<String>>(table: T, msg: S) -> Self {
        CdcError::CommitConflict {
            table: table.into(),
            message: msg.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        CdcError::Generic(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        CdcError::Timeout(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        CdcError::Authentication(msg.into())
    }

    /// Create a new retry exhaustion error
    pub fn retry_exhausted<S: Into<String>>(msg: S) -> Self {
        CdcError::RetryExhausted(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        CdcError::Cancelled(msg.into())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        CdcError::Unsupported(msg.into())
    }

    /// Classify this error for retry and state-machine decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            CdcError::Connection(_)
            | CdcError::Buffer(_)
            | CdcError::Io(_)
            | CdcError::ObjectStore(_)
            | CdcError::Timeout(_) => ErrorKind::Transient,

            #[cfg(feature = "postgres")]
            CdcError::Postgres(e) => classify_postgres(e),

            CdcError::Database(e) => classify_sqlx(e),

            CdcError::Protocol(_) | CdcError::MalformedEvent(_) | CdcError::Serialization(_) => {
                ErrorKind::MalformedEvent
            }

            CdcError::Encoding(_) | CdcError::Arrow(_) | CdcError::Parquet(_) => {
                ErrorKind::Encoding
            }

            CdcError::CommitConflict { .. } | CdcError::CheckpointRegression { .. } => {
                ErrorKind::Consistency
            }

            CdcError::Cancelled(_) => ErrorKind::Cancelled,

            CdcError::Config(_)
            | CdcError::ReplicationSlot(_)
            | CdcError::Publication(_)
            | CdcError::Catalog(_)
            | CdcError::Generic(_)
            | CdcError::Authentication(_)
            | CdcError::RetryExhausted(_)
            | CdcError::Unsupported(_) => ErrorKind::Unrecoverable,
        }
    }

    /// True when retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True when the pipeline must stop and wait for an operator
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Unrecoverable
    }
}

fn classify_sqlx(e: &sqlx::Error) -> ErrorKind {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => ErrorKind::Transient,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            // SQLITE_BUSY / SQLITE_LOCKED
            if message.contains("locked") || message.contains("busy") {
                ErrorKind::Transient
            } else {
                ErrorKind::Unrecoverable
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => ErrorKind::MalformedEvent,
        _ => ErrorKind::Unrecoverable,
    }
}

#[cfg(feature = "postgres")]
fn classify_postgres(e: &tokio_postgres::Error) -> ErrorKind {
    use tokio_postgres::error::SqlState;

    match e.code() {
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::T_R_SERIALIZATION_FAILURE =>
        {
            ErrorKind::Transient
        }
        // authentication, privileges, undefined objects
        Some(_) => ErrorKind::Unrecoverable,
        None => ErrorKind::Transient,
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
