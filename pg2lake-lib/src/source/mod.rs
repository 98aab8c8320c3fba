//! Source Reader: PostgreSQL logical replication into ordered change events.
//!
//! [`ChangeSource`] is the seam the pipeline depends on. [`PostgresSource`]
//! implements it over any [`ReplicationTransport`]; the libpq transport is
//! compiled with the `postgres` feature.

pub mod decoder;
pub mod protocol;
pub mod reader;
pub mod transport;
pub mod wire;

#[cfg(feature = "postgres")]
pub mod admin;

use crate::error::Result;
use crate::types::{ChangeEvent, FieldType, Lsn, Position};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

pub use decoder::{field_type_for_oid, EventDecoder};
pub use reader::{PostgresSource, SourceConfig};
pub use transport::ReplicationTransport;

#[cfg(feature = "postgres")]
pub use admin::PostgresAdmin;
#[cfg(feature = "postgres")]
pub use transport::PgWalTransport;

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// Best-effort table extraction from a DDL notice payload.
    ///
    /// Accepts `{"schema": "...", "table": "..."}` JSON or a statement
    /// containing `TABLE [IF EXISTS] schema.table`.
    pub fn from_ddl_payload(payload: &str) -> Option<Self> {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) {
            let schema = json.get("schema")?.as_str()?;
            let table = json.get("table")?.as_str()?;
            return Some(Self::new(schema, table));
        }

        let tokens: Vec<&str> = payload.split_whitespace().collect();
        let at = tokens.iter().position(|t| t.eq_ignore_ascii_case("table"))?;
        let mut rest = tokens[at + 1..].iter();
        let mut name = rest.next()?;
        if name.eq_ignore_ascii_case("if") {
            rest.next();
            name = rest.next()?;
        }
        let name = name.split('(').next()?.trim_end_matches(';');
        let (schema, table) = name.split_once('.')?;
        Some(Self::new(schema.trim_matches('"'), table.trim_matches('"')))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Column as announced by the upstream relation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub name: String,
    pub type_oid: u32,
    /// Destination type when the source type has a known mapping
    pub field_type: Option<FieldType>,
    pub is_key: bool,
}

/// What changed in an upstream table definition
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// First relation metadata seen for the table in this session
    Discovered,
    Altered {
        added: Vec<String>,
        dropped: Vec<String>,
        retyped: Vec<String>,
    },
    /// DDL announced through a logical decoding message
    DdlMessage { statement: String },
}

/// Upstream DDL, surfaced instead of a row event
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChangeNotice {
    pub source_id: String,
    pub table: Option<TableRef>,
    pub change: SchemaChange,
    pub columns: Vec<SourceColumn>,
}

/// Item produced by a [`ChangeSource`]
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    Change(ChangeEvent),
    SchemaChange(SchemaChangeNotice),
}

/// Upstream change stream consumed by the pipeline producer
#[async_trait]
pub trait ChangeSource: Send {
    /// Connect, prepare the slot and start streaming after `start`.
    /// `None` begins at the slot's earliest available position.
    async fn start(&mut self, start: Option<Position>) -> Result<()>;

    /// Next message in commit order. Returns `Ok(None)` when cancelled or when
    /// the stream was idle; the caller simply asks again.
    async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<SourceMessage>>;

    /// Keep the upstream session alive without consuming events (backpressure pause)
    async fn keepalive(&mut self) -> Result<()>;

    /// Release the upstream connection
    async fn stop(&mut self) -> Result<()>;
}

/// Flushed position shared between the checkpoint path and the reader.
///
/// The orchestrator advances it after each durable checkpoint; the reader
/// reports it upstream so the slot can recycle WAL.
#[derive(Debug, Default)]
pub struct LsnFeedback {
    flushed: AtomicU64,
}

impl LsnFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a durable position. Never moves backwards.
    pub fn update(&self, position: &Position) {
        self.flushed.fetch_max(position.flush_lsn(), Ordering::AcqRel);
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_from_ddl_statement() {
        assert_eq!(
            TableRef::from_ddl_payload("ALTER TABLE public.users ADD COLUMN age int"),
            Some(TableRef::new("public", "users"))
        );
        assert_eq!(
            TableRef::from_ddl_payload("create table if not exists sales.\"orders\"(id int)"),
            Some(TableRef::new("sales", "orders"))
        );
        assert_eq!(
            TableRef::from_ddl_payload(r#"{"schema":"public","table":"t","ddl":"..."}"#),
            Some(TableRef::new("public", "t"))
        );
        assert_eq!(TableRef::from_ddl_payload("VACUUM"), None);
    }

    #[test]
    fn test_feedback_is_monotonic() {
        let feedback = LsnFeedback::new();
        feedback.update(&Position::new(0x20, 4));
        feedback.update(&Position::new(0x10, 9));
        assert_eq!(feedback.flushed_lsn(), 0x20);
    }
}
