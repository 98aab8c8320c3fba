//! Turns pgoutput messages into change events and schema-change notices.
//!
//! The decoder owns the relation cache and the open-transaction context. Row
//! events take their position from the commit LSN announced by `Begin` plus
//! an ordinal, so a transaction replayed after reconnect yields identical
//! positions.

use super::protocol::{ColumnInfo, LogicalReplicationMessage, Oid, ReplicaIdentity, TupleData, TupleValue, Xid};
use super::{SchemaChange, SchemaChangeNotice, SourceColumn, SourceMessage, TableRef};
use crate::error::{CdcError, Result};
use crate::types::{
    format_lsn, hex_decode, postgres_timestamp_to_chrono, ChangeEvent, ColumnValue, FieldType, Lsn,
    Position, RowData,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

/// PostgreSQL built-in type OIDs the decoder converts
pub mod pg_types {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const JSON: Oid = 114;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const NUMERIC: Oid = 1700;
    pub const UUID: Oid = 2950;
    pub const JSONB: Oid = 3802;
}

/// Destination type for a PostgreSQL column type, when the mapping is known
pub fn field_type_for_oid(type_id: Oid) -> Option<FieldType> {
    use pg_types::*;
    match type_id {
        BOOL => Some(FieldType::Boolean),
        INT2 | INT4 => Some(FieldType::Int),
        INT8 | OID => Some(FieldType::Long),
        FLOAT4 => Some(FieldType::Float),
        FLOAT8 => Some(FieldType::Double),
        BYTEA => Some(FieldType::Binary),
        TIMESTAMP | TIMESTAMPTZ => Some(FieldType::Timestamp),
        TEXT | VARCHAR | BPCHAR | JSON | JSONB | UUID | NUMERIC | DATE | TIME => {
            Some(FieldType::String)
        }
        _ => None,
    }
}

/// Convert one tuple column to a typed value. `None` means the column was
/// an unchanged TOAST value and must be left out of the row image.
pub fn decode_value(type_id: Oid, value: &TupleValue) -> Result<Option<ColumnValue>> {
    let text = match value {
        TupleValue::Null => return Ok(Some(ColumnValue::Null)),
        TupleValue::Unchanged => return Ok(None),
        TupleValue::Binary(bytes) => return Ok(Some(ColumnValue::Binary(bytes.to_vec()))),
        TupleValue::Text(bytes) => std::str::from_utf8(bytes)
            .map_err(|e| CdcError::malformed(format!("Column text is not UTF-8: {}", e)))?,
    };

    use pg_types::*;
    let parsed = match type_id {
        BOOL => match text {
            "t" => ColumnValue::Boolean(true),
            "f" => ColumnValue::Boolean(false),
            other => {
                return Err(CdcError::malformed(format!("Invalid boolean text: {}", other)));
            }
        },
        INT2 | INT4 | INT8 | OID => text
            .parse::<i64>()
            .map(ColumnValue::Integer)
            .map_err(|e| CdcError::malformed(format!("Invalid integer text {}: {}", text, e)))?,
        // NaN and infinities have no JSON form in the buffer; keep them as text
        FLOAT4 => match text.parse::<f32>() {
            Ok(f) if f.is_finite() => ColumnValue::Float(f),
            _ => ColumnValue::Text(text.to_string()),
        },
        FLOAT8 => match text.parse::<f64>() {
            Ok(d) if d.is_finite() => ColumnValue::Double(d),
            _ => ColumnValue::Text(text.to_string()),
        },
        BYTEA => match text.strip_prefix("\\x").and_then(hex_decode) {
            Some(bytes) => ColumnValue::Binary(bytes),
            None => ColumnValue::Text(text.to_string()),
        },
        TIMESTAMP => match NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
            Ok(naive) => ColumnValue::Timestamp(naive.and_utc()),
            Err(_) => ColumnValue::Text(text.to_string()),
        },
        TIMESTAMPTZ => match DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
            Ok(ts) => ColumnValue::Timestamp(ts.with_timezone(&Utc)),
            Err(_) => ColumnValue::Text(text.to_string()),
        },
        JSON | JSONB => match serde_json::from_str(text) {
            Ok(json) => ColumnValue::Json(json),
            Err(_) => ColumnValue::Text(text.to_string()),
        },
        _ => ColumnValue::Text(text.to_string()),
    };

    Ok(Some(parsed))
}

#[derive(Debug, Clone)]
struct RelationInfo {
    namespace: String,
    name: String,
    replica_identity: ReplicaIdentity,
    columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    fn table_ref(&self) -> TableRef {
        TableRef::new(&self.namespace, &self.name)
    }

    fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| c.name.clone())
            .collect()
    }

    fn source_columns(&self) -> Vec<SourceColumn> {
        self.columns
            .iter()
            .map(|c| SourceColumn {
                name: c.name.clone(),
                type_oid: c.type_id,
                field_type: field_type_for_oid(c.type_id),
                is_key: c.is_key(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct TransactionContext {
    commit_lsn: Lsn,
    xid: Xid,
    commit_time: DateTime<Utc>,
    next_sequence: u32,
}

/// Stateful pgoutput to [`SourceMessage`] converter
pub struct EventDecoder {
    source_id: String,
    ddl_message_prefix: String,
    relations: HashMap<Oid, RelationInfo>,
    transaction: Option<TransactionContext>,
}

impl EventDecoder {
    pub fn new(source_id: impl Into<String>, ddl_message_prefix: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ddl_message_prefix: ddl_message_prefix.into(),
            relations: HashMap::new(),
            transaction: None,
        }
    }

    /// Forget relation and transaction state; the server resends both on a new session
    pub fn reset(&mut self) {
        self.relations.clear();
        self.transaction = None;
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn decode(&mut self, message: LogicalReplicationMessage) -> Result<Vec<SourceMessage>> {
        match message {
            LogicalReplicationMessage::Begin {
                final_lsn,
                timestamp,
                xid,
            } => {
                if let Some(open) = self.transaction {
                    warn!(
                        "BEGIN for xid {} while xid {} is still open; discarding the open transaction",
                        xid, open.xid
                    );
                }
                self.transaction = Some(TransactionContext {
                    commit_lsn: final_lsn,
                    xid,
                    commit_time: postgres_timestamp_to_chrono(timestamp),
                    next_sequence: 0,
                });
                Ok(Vec::new())
            }

            LogicalReplicationMessage::Commit { commit_lsn, .. } => {
                match self.transaction.take() {
                    Some(tx) if tx.commit_lsn != commit_lsn => warn!(
                        "COMMIT at {} does not match BEGIN final LSN {}",
                        format_lsn(commit_lsn),
                        format_lsn(tx.commit_lsn)
                    ),
                    Some(_) => {}
                    None => debug!("COMMIT at {} without open transaction", format_lsn(commit_lsn)),
                }
                Ok(Vec::new())
            }

            LogicalReplicationMessage::Relation {
                relation_id,
                namespace,
                relation_name,
                replica_identity,
                columns,
            } => {
                let relation = RelationInfo {
                    namespace,
                    name: relation_name,
                    replica_identity,
                    columns,
                };
                let change = match self.relations.get(&relation_id) {
                    None => Some(SchemaChange::Discovered),
                    Some(cached) => diff_relation(cached, &relation),
                };
                let notice = change.map(|change| {
                    SourceMessage::SchemaChange(SchemaChangeNotice {
                        source_id: self.source_id.clone(),
                        table: Some(relation.table_ref()),
                        change,
                        columns: relation.source_columns(),
                    })
                });
                self.relations.insert(relation_id, relation);
                Ok(notice.into_iter().collect())
            }

            LogicalReplicationMessage::Insert { relation_id, tuple } => {
                let relation = self.relation(relation_id)?;
                let after = tuple_to_row(relation, &tuple)?;
                let key_columns = relation.key_columns();
                let table = relation.table_ref();
                let tx = self.next_position()?;
                let event = ChangeEvent::insert(&self.source_id, &table.schema, &table.table, tx.0, after);
                Ok(vec![SourceMessage::Change(finish(event, key_columns, tx))])
            }

            LogicalReplicationMessage::Update {
                relation_id,
                old_tuple,
                new_tuple,
                ..
            } => {
                let relation = self.relation(relation_id)?;
                let after = tuple_to_row(relation, &new_tuple)?;
                let key_columns = relation.key_columns();
                let before = match &old_tuple {
                    Some(old) => tuple_to_row(relation, old)?,
                    // replica identity key unchanged: the identity is in the new row
                    None => after
                        .iter()
                        .filter(|(name, _)| key_columns.contains(name))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                };
                let table = relation.table_ref();
                let tx = self.next_position()?;
                let event =
                    ChangeEvent::update(&self.source_id, &table.schema, &table.table, tx.0, before, after);
                Ok(vec![SourceMessage::Change(finish(event, key_columns, tx))])
            }

            LogicalReplicationMessage::Delete {
                relation_id,
                old_tuple,
                key_type,
            } => {
                let relation = self.relation(relation_id)?;
                let before = tuple_to_row(relation, &old_tuple)?;
                let mut key_columns = relation.key_columns();
                if key_columns.is_empty() && key_type == b'O' {
                    key_columns = before.keys().cloned().collect();
                }
                if relation.replica_identity == ReplicaIdentity::Nothing {
                    warn!(
                        "DELETE on {} with REPLICA IDENTITY NOTHING carries no row identity",
                        relation.table_ref()
                    );
                }
                let table = relation.table_ref();
                let tx = self.next_position()?;
                let event = ChangeEvent::delete(&self.source_id, &table.schema, &table.table, tx.0, before);
                Ok(vec![SourceMessage::Change(finish(event, key_columns, tx))])
            }

            LogicalReplicationMessage::Truncate { relation_ids, .. } => {
                let mut out = Vec::with_capacity(relation_ids.len());
                for relation_id in relation_ids {
                    let table = self.relation(relation_id)?.table_ref();
                    let tx = self.next_position()?;
                    let event = ChangeEvent::truncate(&self.source_id, &table.schema, &table.table, tx.0);
                    out.push(SourceMessage::Change(finish(event, Vec::new(), tx)));
                }
                Ok(out)
            }

            LogicalReplicationMessage::Message {
                prefix, content, ..
            } if prefix == self.ddl_message_prefix => {
                let statement = String::from_utf8_lossy(&content).into_owned();
                Ok(vec![SourceMessage::SchemaChange(SchemaChangeNotice {
                    source_id: self.source_id.clone(),
                    table: TableRef::from_ddl_payload(&statement),
                    change: SchemaChange::DdlMessage { statement },
                    columns: Vec::new(),
                })])
            }

            LogicalReplicationMessage::Message { prefix, .. } => {
                debug!("Ignoring logical message with prefix {}", prefix);
                Ok(Vec::new())
            }

            LogicalReplicationMessage::Origin { origin_name, .. } => {
                debug!("Transaction replicated from origin {}", origin_name);
                Ok(Vec::new())
            }

            LogicalReplicationMessage::Type { type_name, .. } => {
                debug!("Custom type {} announced", type_name);
                Ok(Vec::new())
            }
        }
    }

    fn relation(&self, relation_id: Oid) -> Result<&RelationInfo> {
        self.relations.get(&relation_id).ok_or_else(|| {
            CdcError::malformed(format!("Change for unknown relation {}", relation_id))
        })
    }

    fn next_position(&mut self) -> Result<(Position, Xid, DateTime<Utc>)> {
        let tx = self
            .transaction
            .as_mut()
            .ok_or_else(|| CdcError::malformed("Row change outside of a transaction"))?;
        let position = Position::new(tx.commit_lsn, tx.next_sequence);
        tx.next_sequence += 1;
        Ok((position, tx.xid, tx.commit_time))
    }
}

fn finish(
    event: ChangeEvent,
    key_columns: Vec<String>,
    tx: (Position, Xid, DateTime<Utc>),
) -> ChangeEvent {
    event
        .with_key_columns(key_columns)
        .with_transaction(tx.1)
        .with_event_time(tx.2)
}

fn tuple_to_row(relation: &RelationInfo, tuple: &TupleData) -> Result<RowData> {
    if tuple.len() != relation.columns.len() {
        return Err(CdcError::malformed(format!(
            "Tuple for {} has {} columns, relation has {}",
            relation.table_ref(),
            tuple.len(),
            relation.columns.len()
        )));
    }

    let mut row = RowData::new();
    for (column, value) in relation.columns.iter().zip(tuple) {
        if let Some(decoded) = decode_value(column.type_id, value)? {
            row.insert(column.name.clone(), decoded);
        }
    }
    Ok(row)
}

fn diff_relation(cached: &RelationInfo, current: &RelationInfo) -> Option<SchemaChange> {
    let added: Vec<String> = current
        .columns
        .iter()
        .filter(|c| !cached.columns.iter().any(|o| o.name == c.name))
        .map(|c| c.name.clone())
        .collect();
    let dropped: Vec<String> = cached
        .columns
        .iter()
        .filter(|o| !current.columns.iter().any(|c| c.name == o.name))
        .map(|o| o.name.clone())
        .collect();
    let retyped: Vec<String> = current
        .columns
        .iter()
        .filter(|c| {
            cached
                .columns
                .iter()
                .any(|o| o.name == c.name && (o.type_id != c.type_id || o.type_modifier != c.type_modifier))
        })
        .map(|c| c.name.clone())
        .collect();

    if added.is_empty() && dropped.is_empty() && retyped.is_empty() {
        None
    } else {
        Some(SchemaChange::Altered {
            added,
            dropped,
            retyped,
        })
    }
}
