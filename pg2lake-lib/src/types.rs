//! Shared value types exchanged by every pipeline component: change events,
//! replication positions, checkpoints and the destination table model.

use crate::error::{CdcError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Raw PostgreSQL log sequence number
pub type Lsn = u64;

/// Format an LSN the way PostgreSQL prints it (`16/B374D848`)
pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parse an LSN from PostgreSQL's `X/Y` notation
pub fn parse_lsn(text: &str) -> Result<Lsn> {
    let (high, low) = text
        .split_once('/')
        .ok_or_else(|| CdcError::protocol(format!("Invalid LSN format: {}", text)))?;
    let high = u64::from_str_radix(high, 16)
        .map_err(|e| CdcError::protocol(format!("Invalid LSN high part {}: {}", text, e)))?;
    let low = u64::from_str_radix(low, 16)
        .map_err(|e| CdcError::protocol(format!("Invalid LSN low part {}: {}", text, e)))?;
    if high > 0xFFFF_FFFF || low > 0xFFFF_FFFF {
        return Err(CdcError::protocol(format!("LSN out of range: {}", text)));
    }
    Ok((high << 32) | low)
}

/// Convert microseconds since the PostgreSQL epoch to a UTC timestamp
pub fn postgres_timestamp_to_chrono(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros + PG_EPOCH_OFFSET_SECS * 1_000_000;
    Utc.timestamp_micros(unix_micros)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Convert a UTC timestamp to microseconds since the PostgreSQL epoch
pub fn chrono_to_postgres_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Position of an event in the replication stream.
///
/// A position is the commit LSN of the transaction the event belongs to plus
/// the ordinal of the event inside that transaction. Transactions arrive in
/// commit order, so positions are strictly increasing across the stream and a
/// re-delivered transaction reproduces exactly the same positions.
///
/// The textual form is fixed-width upper-case hex (`XXXXXXXXXXXXXXXX/XXXXXXXX`),
/// which makes lexical comparison agree with [`Ord`]. The SQL checkpoint store
/// relies on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub commit_lsn: Lsn,
    pub sequence: u32,
}

impl Position {
    pub const ZERO: Position = Position {
        commit_lsn: 0,
        sequence: 0,
    };

    pub fn new(commit_lsn: Lsn, sequence: u32) -> Self {
        Self {
            commit_lsn,
            sequence,
        }
    }

    /// LSN to report upstream as flushed once this position is durable.
    ///
    /// The transaction at `commit_lsn` is re-sent on restart and its already
    /// applied events are dropped by position.
    pub fn flush_lsn(&self) -> Lsn {
        self.commit_lsn
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}/{:08X}", self.commit_lsn, self.sequence)
    }
}

impl FromStr for Position {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (lsn, seq) = s
            .split_once('/')
            .ok_or_else(|| CdcError::protocol(format!("Invalid position: {}", s)))?;
        if lsn.len() != 16 || seq.len() != 8 {
            return Err(CdcError::protocol(format!("Invalid position width: {}", s)));
        }
        let commit_lsn = u64::from_str_radix(lsn, 16)
            .map_err(|e| CdcError::protocol(format!("Invalid position {}: {}", s, e)))?;
        let sequence = u32::from_str_radix(seq, 16)
            .map_err(|e| CdcError::protocol(format!("Invalid position {}: {}", s, e)))?;
        Ok(Self::new(commit_lsn, sequence))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Row-level operation carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "TRUNCATE" => Ok(Operation::Truncate),
            other => Err(CdcError::malformed(format!("Unknown operation: {}", other))),
        }
    }
}

/// A single column value decoded from the replication stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    Binary(Vec<u8>),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// String rendering used when a column resolved to the string type
    pub fn to_text(&self) -> Option<String> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Boolean(b) => Some(b.to_string()),
            ColumnValue::Integer(i) => Some(i.to_string()),
            ColumnValue::Float(f) => Some(f.to_string()),
            ColumnValue::Double(d) => Some(d.to_string()),
            ColumnValue::Binary(bytes) => Some(format!("\\x{}", hex_encode(bytes))),
            ColumnValue::Text(s) => Some(s.clone()),
            ColumnValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            ColumnValue::Json(v) => Some(v.to_string()),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Integer(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        ColumnValue::Integer(value as i64)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Boolean(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Double(value)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Column name to value mapping for one row image
pub type RowData = BTreeMap<String, ColumnValue>;

/// One captured row mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_id: String,
    pub schema_name: String,
    pub table_name: String,
    pub operation: Operation,
    pub position: Position,
    pub transaction_id: Option<u32>,
    pub event_time: DateTime<Utc>,
    /// Ordered column names forming the row identity
    pub key_columns: Vec<String>,
    pub before: Option<RowData>,
    pub after: Option<RowData>,
}

impl ChangeEvent {
    fn base(
        operation: Operation,
        source_id: &str,
        schema_name: &str,
        table_name: &str,
        position: Position,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            operation,
            position,
            transaction_id: None,
            event_time: Utc::now(),
            key_columns: Vec::new(),
            before: None,
            after: None,
        }
    }

    pub fn insert(
        source_id: &str,
        schema_name: &str,
        table_name: &str,
        position: Position,
        after: RowData,
    ) -> Self {
        let mut event = Self::base(Operation::Insert, source_id, schema_name, table_name, position);
        event.after = Some(after);
        event
    }

    pub fn update(
        source_id: &str,
        schema_name: &str,
        table_name: &str,
        position: Position,
        before: RowData,
        after: RowData,
    ) -> Self {
        let mut event = Self::base(Operation::Update, source_id, schema_name, table_name, position);
        event.before = Some(before);
        event.after = Some(after);
        event
    }

    pub fn delete(
        source_id: &str,
        schema_name: &str,
        table_name: &str,
        position: Position,
        before: RowData,
    ) -> Self {
        let mut event = Self::base(Operation::Delete, source_id, schema_name, table_name, position);
        event.before = Some(before);
        event
    }

    pub fn truncate(source_id: &str, schema_name: &str, table_name: &str, position: Position) -> Self {
        Self::base(Operation::Truncate, source_id, schema_name, table_name, position)
    }

    pub fn with_transaction(mut self, transaction_id: u32) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Self {
        self.key_columns = key_columns;
        self
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Row image written to the lake: `after` when present, else `before`
    pub fn row_image(&self) -> Option<&RowData> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Check the operation/image invariant
    pub fn validate(&self) -> Result<()> {
        let ok = match self.operation {
            Operation::Insert => self.after.is_some() && self.before.is_none(),
            Operation::Update => self.after.is_some() && self.before.is_some(),
            Operation::Delete => self.before.is_some() && self.after.is_none(),
            Operation::Truncate => self.before.is_none() && self.after.is_none(),
        };
        if !ok {
            return Err(CdcError::malformed(format!(
                "{} event on {} at {} has inconsistent row images",
                self.operation,
                self.qualified_table(),
                self.position
            )));
        }
        Ok(())
    }
}

/// A change event persisted in the durable buffer
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    /// Buffer-assigned, monotonically increasing
    pub id: i64,
    pub event: ChangeEvent,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Last safely applied position for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub position: Position,
    pub transaction_id: Option<u32>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, position: Position) -> Self {
        Self {
            source_id: source_id.into(),
            position,
            transaction_id: None,
            committed_at: Utc::now(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Column type in the destination table format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Binary,
    String,
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "boolean",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Binary => "binary",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamptz",
        };
        f.write_str(name)
    }
}

/// One column of a [`TableSchema`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// Versioned destination schema. Field ids are never reused or reassigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema_id: i32,
    pub fields: Vec<Field>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn highest_field_id(&self) -> i32 {
        self.fields.iter().map(|f| f.id).max().unwrap_or(0)
    }
}

/// Partition transform applied to a source field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Identity,
    Day,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionField {
    pub source_id: i32,
    pub field_id: i32,
    pub name: String,
    pub transform: Transform,
}

/// Partitioning of a table, derived from its timestamp field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub spec_id: i32,
    pub fields: Vec<PartitionField>,
}

impl PartitionSpec {
    pub fn unpartitioned() -> Self {
        Self {
            spec_id: 0,
            fields: Vec::new(),
        }
    }

    /// Day buckets over `field_name`, which must exist in `schema`
    pub fn day(schema: &TableSchema, field_name: &str) -> Result<Self> {
        let field = schema.field(field_name).ok_or_else(|| {
            CdcError::catalog(format!("Partition source field {} not in schema", field_name))
        })?;
        Ok(Self {
            spec_id: 0,
            fields: vec![PartitionField {
                source_id: field.id,
                field_id: 1000,
                name: format!("{}_day", field_name),
                transform: Transform::Day,
            }],
        })
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Parquet,
}

/// A data file registered by exactly one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub file_path: String,
    pub format: FileFormat,
    pub record_count: u64,
    pub size_bytes: u64,
    pub partition_data: BTreeMap<String, serde_json::Value>,
}
