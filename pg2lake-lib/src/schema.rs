//! Schema Builder
//!
//! Infers a destination [`TableSchema`] from change events and evolves an
//! existing schema when new columns show up. Field ids are handed out once:
//! user columns first (alphabetical on creation, appended on evolution), the
//! three system columns always last with their original ids.

use crate::source::{SchemaChangeNotice, SourceColumn, TableRef};
use crate::types::{ChangeEvent, ColumnValue, Field, FieldType, TableSchema};
use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema, TimeUnit};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub const CDC_OPERATION_COLUMN: &str = "_cdc_operation";
pub const CDC_TIMESTAMP_COLUMN: &str = "_cdc_timestamp";
pub const CDC_LSN_COLUMN: &str = "_cdc_lsn";

/// System columns in their fixed order
pub const SYSTEM_COLUMNS: [(&str, FieldType); 3] = [
    (CDC_OPERATION_COLUMN, FieldType::String),
    (CDC_TIMESTAMP_COLUMN, FieldType::Timestamp),
    (CDC_LSN_COLUMN, FieldType::String),
];

/// Arrow field metadata key carrying the destination field id
pub const FIELD_ID_METADATA_KEY: &str = "PARQUET:field_id";

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.iter().any(|(n, _)| *n == name)
}

/// Source-declared column types, fed by schema-change notices
#[derive(Debug, Default)]
pub struct TypeHints {
    tables: RwLock<HashMap<TableRef, HashMap<String, FieldType>>>,
}

impl TypeHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the hints of a table with the columns announced upstream
    pub fn register(&self, table: &TableRef, columns: &[SourceColumn]) {
        let hints: HashMap<String, FieldType> = columns
            .iter()
            .filter_map(|c| c.field_type.map(|t| (c.name.clone(), t)))
            .collect();
        if hints.is_empty() {
            return;
        }
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.insert(table.clone(), hints);
    }

    pub fn apply_notice(&self, notice: &SchemaChangeNotice) {
        if let Some(table) = &notice.table {
            self.register(table, &notice.columns);
        }
    }

    pub fn get(&self, table: &TableRef, column: &str) -> Option<FieldType> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).and_then(|t| t.get(column).copied())
    }
}

/// Type a runtime value would get without a source hint; `None` for null
pub fn infer_value_type(value: &ColumnValue) -> Option<FieldType> {
    match value {
        ColumnValue::Null => None,
        ColumnValue::Boolean(_) => Some(FieldType::Boolean),
        ColumnValue::Integer(i) => {
            if i32::try_from(*i).is_ok() {
                Some(FieldType::Int)
            } else {
                Some(FieldType::Long)
            }
        }
        ColumnValue::Float(_) => Some(FieldType::Float),
        ColumnValue::Double(_) => Some(FieldType::Double),
        ColumnValue::Binary(_) => Some(FieldType::Binary),
        ColumnValue::Timestamp(_) => Some(FieldType::Timestamp),
        ColumnValue::Text(_) | ColumnValue::Json(_) => Some(FieldType::String),
    }
}

/// Common type of two observations of the same column
pub fn resolve_types(a: FieldType, b: FieldType) -> FieldType {
    use FieldType::*;
    match (a, b) {
        (x, y) if x == y => x,
        (Int, Long) | (Long, Int) => Long,
        (Float, Double) | (Double, Float) => Double,
        _ => String,
    }
}

fn is_widening(from: FieldType, to: FieldType) -> bool {
    matches!(
        (from, to),
        (FieldType::Int, FieldType::Long) | (FieldType::Float, FieldType::Double)
    )
}

pub struct SchemaBuilder {
    hints: Arc<TypeHints>,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new(Arc::new(TypeHints::new()))
    }
}

impl SchemaBuilder {
    pub fn new(hints: Arc<TypeHints>) -> Self {
        Self { hints }
    }

    pub fn hints(&self) -> &Arc<TypeHints> {
        &self.hints
    }

    /// Column types observed across `events`, alphabetical
    pub fn infer_columns<'a, I>(&self, events: I) -> BTreeMap<String, FieldType>
    where
        I: IntoIterator<Item = &'a ChangeEvent>,
    {
        let mut observed: BTreeMap<String, Option<FieldType>> = BTreeMap::new();
        let mut hinted: BTreeMap<String, FieldType> = BTreeMap::new();

        for event in events {
            let Some(row) = event.row_image() else {
                continue;
            };
            let table = TableRef::new(&event.schema_name, &event.table_name);
            for (column, value) in row {
                if is_system_column(column) {
                    warn!("Ignoring source column {} that shadows a system column", column);
                    continue;
                }
                if let Some(hint) = self.hints.get(&table, column) {
                    hinted.insert(column.clone(), hint);
                    observed.entry(column.clone()).or_insert(None);
                    continue;
                }
                let slot = observed.entry(column.clone()).or_insert(None);
                if let Some(inferred) = infer_value_type(value) {
                    *slot = Some(match *slot {
                        Some(current) => resolve_types(current, inferred),
                        None => inferred,
                    });
                }
            }
        }

        observed
            .into_iter()
            .map(|(name, inferred)| {
                let field_type = hinted
                    .get(&name)
                    .copied()
                    .or(inferred)
                    .unwrap_or(FieldType::String);
                (name, field_type)
            })
            .collect()
    }

    /// Schema for a new table: sorted user columns, then system columns
    pub fn build_schema<'a, I>(&self, events: I) -> TableSchema
    where
        I: IntoIterator<Item = &'a ChangeEvent>,
    {
        let columns = self.infer_columns(events);
        let mut fields: Vec<Field> = Vec::with_capacity(columns.len() + SYSTEM_COLUMNS.len());
        for (name, field_type) in columns {
            fields.push(Field {
                id: fields.len() as i32 + 1,
                name,
                field_type,
                required: false,
                doc: None,
            });
        }
        for (name, field_type) in SYSTEM_COLUMNS {
            fields.push(Field {
                id: fields.len() as i32 + 1,
                name: name.to_string(),
                field_type,
                required: true,
                doc: Some("Change data capture metadata".to_string()),
            });
        }
        debug!("Built schema with {} fields", fields.len());
        TableSchema {
            schema_id: 0,
            fields,
        }
    }

    /// Evolve `existing` with the columns of `candidate`.
    ///
    /// Existing fields keep their ids and positions (int→long and float→double
    /// promotions are applied in place); absent user columns are appended with
    /// fresh ids before the system columns. Returns `existing` unchanged when
    /// there is nothing to add.
    pub fn merge_schemas(&self, existing: &TableSchema, candidate: &TableSchema) -> TableSchema {
        let mut next_id = existing.highest_field_id() + 1;
        let mut changed = false;

        let mut user: Vec<Field> = Vec::new();
        let mut system: Vec<Field> = Vec::new();
        for field in &existing.fields {
            let mut field = field.clone();
            if let Some(incoming) = candidate.field(&field.name) {
                if is_widening(field.field_type, incoming.field_type) {
                    info!(
                        "Promoting column {} from {} to {}",
                        field.name, field.field_type, incoming.field_type
                    );
                    field.field_type = incoming.field_type;
                    changed = true;
                }
            }
            if is_system_column(&field.name) {
                system.push(field);
            } else {
                user.push(field);
            }
        }

        for field in &candidate.fields {
            if is_system_column(&field.name) || existing.field(&field.name).is_some() {
                continue;
            }
            info!("Adding column {} ({}) with field id {}", field.name, field.field_type, next_id);
            user.push(Field {
                id: next_id,
                name: field.name.clone(),
                field_type: field.field_type,
                required: false,
                doc: field.doc.clone(),
            });
            next_id += 1;
            changed = true;
        }

        for (name, field_type) in SYSTEM_COLUMNS {
            if !system.iter().any(|f| f.name == name) {
                system.push(Field {
                    id: next_id,
                    name: name.to_string(),
                    field_type,
                    required: true,
                    doc: None,
                });
                next_id += 1;
                changed = true;
            }
        }

        if !changed {
            return existing.clone();
        }

        user.extend(system);
        TableSchema {
            schema_id: existing.schema_id + 1,
            fields: user,
        }
    }
}

pub fn arrow_data_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Boolean => DataType::Boolean,
        FieldType::Int => DataType::Int32,
        FieldType::Long => DataType::Int64,
        FieldType::Float => DataType::Float32,
        FieldType::Double => DataType::Float64,
        FieldType::Binary => DataType::Binary,
        FieldType::String => DataType::Utf8,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

/// Arrow schema with the field ids attached as parquet field-id metadata
pub fn to_arrow_schema(schema: &TableSchema) -> ArrowSchema {
    let fields: Vec<ArrowField> = schema
        .fields
        .iter()
        .map(|f| {
            ArrowField::new(&f.name, arrow_data_type(f.field_type), !f.required).with_metadata(
                HashMap::from([(FIELD_ID_METADATA_KEY.to_string(), f.id.to_string())]),
            )
        })
        .collect();
    ArrowSchema::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, RowData};

    fn event(columns: &[(&str, ColumnValue)]) -> ChangeEvent {
        let row: RowData = columns
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ChangeEvent::insert("src", "public", "users", Position::new(1, 0), row)
    }

    fn names(schema: &TableSchema) -> Vec<&str> {
        schema.field_names()
    }

    #[test]
    fn test_build_schema_orders_columns_and_appends_system_columns() {
        let builder = SchemaBuilder::default();
        let events = [
            event(&[("name", "alice".into()), ("id", 1i64.into())]),
            event(&[("id", 2i64.into()), ("active", true.into())]),
        ];
        let schema = builder.build_schema(&events);

        assert_eq!(
            names(&schema),
            vec!["active", "id", "name", "_cdc_operation", "_cdc_timestamp", "_cdc_lsn"]
        );
        let ids: Vec<i32> = schema.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(schema.field("id").unwrap().field_type, FieldType::Int);
        assert_eq!(schema.field("active").unwrap().field_type, FieldType::Boolean);
        assert!(schema.field("_cdc_lsn").unwrap().required);
        assert!(!schema.field("name").unwrap().required);
    }

    #[test]
    fn test_inference_precedence_and_conflicts() {
        let builder = SchemaBuilder::default();
        let events = [
            event(&[
                ("small", 7i64.into()),
                ("big", ColumnValue::Integer(i64::from(i32::MAX) + 1)),
                ("ratio", ColumnValue::Float(0.5)),
                ("mixed", 1i64.into()),
                ("blob", ColumnValue::Binary(vec![1, 2])),
                ("empty", ColumnValue::Null),
                ("doc", ColumnValue::Json(serde_json::json!({"a": 1}))),
            ]),
            event(&[
                ("small", 8i64.into()),
                ("ratio", ColumnValue::Double(0.25)),
                ("mixed", "one".into()),
            ]),
        ];
        let columns = builder.infer_columns(&events);

        assert_eq!(columns["small"], FieldType::Int);
        assert_eq!(columns["big"], FieldType::Long);
        assert_eq!(columns["ratio"], FieldType::Double);
        assert_eq!(columns["mixed"], FieldType::String);
        assert_eq!(columns["blob"], FieldType::Binary);
        assert_eq!(columns["empty"], FieldType::String);
        assert_eq!(columns["doc"], FieldType::String);
    }

    #[test]
    fn test_source_hints_win_over_runtime_values() {
        let hints = Arc::new(TypeHints::new());
        hints.register(
            &TableRef::new("public", "users"),
            &[SourceColumn {
                name: "id".to_string(),
                type_oid: 20,
                field_type: Some(FieldType::Long),
                is_key: true,
            }],
        );
        let builder = SchemaBuilder::new(hints);
        let columns = builder.infer_columns(&[event(&[("id", 1i64.into())])]);
        assert_eq!(columns["id"], FieldType::Long);
    }

    #[test]
    fn test_merge_keeps_ids_and_appends_new_columns() {
        let builder = SchemaBuilder::default();
        let initial: Vec<ChangeEvent> = (0..3)
            .map(|i| event(&[("id", (i as i64).into()), ("name", "n".into())]))
            .collect();
        let existing = builder.build_schema(&initial);

        let mut all = initial.clone();
        all.push(event(&[
            ("id", 4i64.into()),
            ("name", "d".into()),
            ("age", 30i64.into()),
            ("email", "d@example.com".into()),
        ]));
        let candidate = builder.build_schema(&all);
        let merged = builder.merge_schemas(&existing, &candidate);

        let mut user: Vec<&str> = merged
            .field_names()
            .into_iter()
            .filter(|n| !is_system_column(n))
            .collect();
        user.sort();
        assert_eq!(user, vec!["age", "email", "id", "name"]);
        assert_eq!(merged.fields.len(), 7);
        assert_eq!(merged.schema_id, existing.schema_id + 1);
        for name in ["id", "name", "_cdc_operation", "_cdc_timestamp", "_cdc_lsn"] {
            assert_eq!(merged.field(name).unwrap().id, existing.field(name).unwrap().id);
        }
        assert_eq!(merged.field("age").unwrap().id, 6);
        assert_eq!(merged.field("email").unwrap().id, 7);
        assert_eq!(
            &merged.field_names()[4..],
            &["_cdc_operation", "_cdc_timestamp", "_cdc_lsn"]
        );
    }

    #[test]
    fn test_merge_without_new_columns_is_identity() {
        let builder = SchemaBuilder::default();
        let existing = builder.build_schema(&[event(&[("id", 1i64.into())])]);
        let candidate = builder.build_schema(&[event(&[("id", 2i64.into())])]);
        assert_eq!(builder.merge_schemas(&existing, &candidate), existing);
    }

    #[test]
    fn test_merge_promotes_int_to_long() {
        let builder = SchemaBuilder::default();
        let existing = builder.build_schema(&[event(&[("id", 1i64.into())])]);
        let candidate = builder.build_schema(&[event(&[("id", ColumnValue::Integer(1 << 40))])]);
        let merged = builder.merge_schemas(&existing, &candidate);
        assert_eq!(merged.field("id").unwrap().field_type, FieldType::Long);
        assert_eq!(merged.field("id").unwrap().id, 1);
        assert_eq!(merged.schema_id, 1);
    }

    #[test]
    fn test_arrow_schema_carries_field_ids() {
        let builder = SchemaBuilder::default();
        let schema = builder.build_schema(&[event(&[("id", 1i64.into())])]);
        let arrow = to_arrow_schema(&schema);
        assert_eq!(arrow.fields().len(), 4);
        assert_eq!(
            arrow.field(0).metadata().get(FIELD_ID_METADATA_KEY).map(String::as_str),
            Some("1")
        );
        assert!(!arrow.field(3).is_nullable());
        assert_eq!(
            arrow.field(2).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
    }
}
