//! Parquet encoding of change events
//!
//! One row per event: the row image projected onto the table's typed user
//! columns, followed by the system columns.

use crate::error::{CdcError, Result};
use crate::schema::{to_arrow_schema, CDC_LSN_COLUMN, CDC_OPERATION_COLUMN, CDC_TIMESTAMP_COLUMN};
use crate::types::{ChangeEvent, ColumnValue, Field, FieldType, TableSchema};
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float32Builder, Float64Builder, Int32Builder,
    Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use tracing::debug;

/// Encoded parquet file plus what went into it
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub bytes: Bytes,
    pub record_count: u64,
}

#[derive(Debug, Clone)]
pub struct ParquetEncoder {
    max_row_group_size: usize,
    compression: Compression,
}

impl ParquetEncoder {
    pub fn new(max_row_group_size: usize) -> Self {
        Self {
            max_row_group_size: max_row_group_size.max(1),
            compression: Compression::SNAPPY,
        }
    }

    /// Build the Arrow batch for `events` under `schema`.
    ///
    /// A value that cannot be stored in its column's type fails the whole
    /// batch with an encoding error naming the event, so the row is never
    /// committed with the value dropped.
    pub fn build_batch(&self, schema: &TableSchema, events: &[&ChangeEvent]) -> Result<RecordBatch> {
        let arrow_schema = Arc::new(to_arrow_schema(schema));
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());

        for field in &schema.fields {
            let column = match field.name.as_str() {
                CDC_OPERATION_COLUMN => {
                    let mut builder = StringBuilder::new();
                    for event in events {
                        builder.append_value(event.operation.as_str());
                    }
                    Arc::new(builder.finish()) as ArrayRef
                }
                CDC_TIMESTAMP_COLUMN => {
                    let mut builder = TimestampMicrosecondBuilder::new().with_timezone("UTC");
                    for event in events {
                        builder.append_value(event.event_time.timestamp_micros());
                    }
                    Arc::new(builder.finish()) as ArrayRef
                }
                CDC_LSN_COLUMN => {
                    let mut builder = StringBuilder::new();
                    for event in events {
                        builder.append_value(event.position.to_string());
                    }
                    Arc::new(builder.finish()) as ArrayRef
                }
                _ => user_column(field, events)?,
            };
            columns.push(column);
        }

        Ok(RecordBatch::try_new(arrow_schema, columns)?)
    }

    pub fn encode(&self, schema: &TableSchema, events: &[&ChangeEvent]) -> Result<EncodedFile> {
        if events.is_empty() {
            return Err(CdcError::encoding("Cannot encode an empty batch"));
        }
        let batch = self.build_batch(schema, events)?;

        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.max_row_group_size)
            .build();

        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        debug!(
            "Encoded {} rows into {} bytes of parquet",
            batch.num_rows(),
            buf.len()
        );
        Ok(EncodedFile {
            bytes: Bytes::from(buf),
            record_count: batch.num_rows() as u64,
        })
    }

    /// Read a parquet file back into record batches
    pub fn decode(bytes: Bytes) -> Result<Vec<RecordBatch>> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        Ok(batches)
    }
}

fn value_of<'a>(field: &Field, event: &'a ChangeEvent) -> Option<&'a ColumnValue> {
    event
        .row_image()
        .and_then(|row| row.get(&field.name))
        .filter(|v| !v.is_null())
}

fn does_not_fit(field: &Field, event: &ChangeEvent, value: &ColumnValue) -> CdcError {
    CdcError::encoding(format!(
        "Value {:?} for column {} of {} at {} does not fit column type {}",
        value,
        field.name,
        event.qualified_table(),
        event.position,
        field.field_type
    ))
}

macro_rules! build_typed {
    ($builder:expr, $field:expr, $events:expr, $convert:expr) => {{
        let mut builder = $builder;
        for event in $events {
            match value_of($field, event) {
                None => builder.append_null(),
                Some(value) => match $convert(value) {
                    Some(v) => builder.append_value(v),
                    None => return Err(does_not_fit($field, event, value)),
                },
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

// integers up to the mantissa width convert to floating point exactly
const F32_EXACT: i64 = 1 << 24;
const F64_EXACT: i64 = 1 << 53;

fn user_column(field: &Field, events: &[&ChangeEvent]) -> Result<ArrayRef> {
    let column = match field.field_type {
        FieldType::Boolean => build_typed!(BooleanBuilder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Boolean(b) => Some(*b),
            _ => None,
        }),
        FieldType::Int => build_typed!(Int32Builder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Integer(i) => i32::try_from(*i).ok(),
            _ => None,
        }),
        FieldType::Long => build_typed!(Int64Builder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Integer(i) => Some(*i),
            _ => None,
        }),
        FieldType::Float => build_typed!(Float32Builder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Float(f) => Some(*f),
            ColumnValue::Integer(i) if i.abs() <= F32_EXACT => Some(*i as f32),
            _ => None,
        }),
        FieldType::Double => build_typed!(Float64Builder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Double(d) => Some(*d),
            ColumnValue::Float(f) => Some(f64::from(*f)),
            ColumnValue::Integer(i) if i.abs() <= F64_EXACT => Some(*i as f64),
            _ => None,
        }),
        FieldType::Binary => build_typed!(BinaryBuilder::new(), field, events, |v: &ColumnValue| match v {
            ColumnValue::Binary(b) => Some(b.clone()),
            _ => None,
        }),
        FieldType::String => build_typed!(StringBuilder::new(), field, events, |v: &ColumnValue| v.to_text()),
        FieldType::Timestamp => build_typed!(
            TimestampMicrosecondBuilder::new().with_timezone("UTC"),
            field,
            events,
            |v: &ColumnValue| match v {
                ColumnValue::Timestamp(ts) => Some(ts.timestamp_micros()),
                _ => None,
            }
        ),
    };
    Ok(column)
}
