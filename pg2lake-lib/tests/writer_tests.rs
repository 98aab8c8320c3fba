/// Table writer tests against the on-disk object store and catalog
///
/// These tests verify that:
/// 1. A failed commit removes the files it uploaded
/// 2. Field ids survive schema evolution across catalog instances
/// 3. Column values read back from parquet exactly as they were written
/// 4. A value that no longer fits its column is rejected instead of nulled
/// 5. A commit whose acknowledgement is lost keeps its data files
mod common;

#[cfg(test)]
mod writer_tests {
    use super::common::*;
    use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
    use bytes::Bytes;
    use pg2lake_lib::schema::SchemaBuilder;
    use pg2lake_lib::error::ErrorKind;
    use pg2lake_lib::types::{BufferedEvent, ChangeEvent, ColumnValue, FieldType, Position, RowData};
    use pg2lake_lib::writer::{
        Catalog, EventWriter, LocalObjectStore, ObjectStore, ObjectStoreCatalog, ParquetEncoder, TableIdent,
        TableWriter,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn buffered(id: i64, lsn: u64, after: RowData) -> BufferedEvent {
        let event = ChangeEvent::insert(SOURCE_ID, "public", "users", Position::new(lsn, 0), after)
            .with_event_time(day(2024, 3, 1));
        BufferedEvent {
            id,
            event,
            created_at: chrono::Utc::now(),
            processed_at: None,
        }
    }

    fn disk(dir: &TempDir) -> (Arc<LocalObjectStore>, Arc<ObjectStoreCatalog>) {
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let catalog = Arc::new(ObjectStoreCatalog::new(store.clone(), BUCKET, PREFIX));
        (store, catalog)
    }

    fn writer(store: Arc<LocalObjectStore>, catalog: Arc<dyn Catalog>) -> TableWriter {
        TableWriter::new(writer_config(), catalog, store, SchemaBuilder::default())
    }

    #[tokio::test]
    async fn test_failed_commit_removes_uploaded_files() {
        let dir = TempDir::new().unwrap();
        let (store, catalog) = disk(&dir);
        let writer = writer(store.clone(), Arc::new(FlakyCatalog::new(catalog.clone(), 0)));

        let batch = vec![
            buffered(1, 0x10, row(&[("id", ColumnValue::Integer(1))])),
            buffered(2, 0x20, row(&[("id", ColumnValue::Integer(2))])),
        ];
        let err = writer.write_events(&batch).await.unwrap_err();
        assert!(err.to_string().contains("injected commit failure"));

        assert!(store
            .list(BUCKET, "warehouse/public/users/data/")
            .await
            .unwrap()
            .is_empty());
        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        assert!(table.current_snapshot().is_none());
        assert_eq!(table.record_count(), 0);
    }

    #[tokio::test]
    async fn test_field_ids_survive_evolution_across_catalog_instances() {
        let dir = TempDir::new().unwrap();
        let users = TableIdent::new("public", "users");

        {
            let (store, catalog) = disk(&dir);
            let first = writer(store, catalog);
            first
                .write_events(&[buffered(
                    1,
                    0x10,
                    row(&[("id", ColumnValue::Integer(1)), ("name", "Alice".into())]),
                )])
                .await
                .unwrap();
            first.close().await.unwrap();
        }

        let (store, catalog) = disk(&dir);
        let second = writer(store.clone(), catalog.clone());
        second
            .write_events(&[buffered(
                2,
                0x20,
                row(&[
                    ("id", ColumnValue::Integer(2)),
                    ("name", "Bob".into()),
                    ("age", ColumnValue::Integer(30)),
                ]),
            )])
            .await
            .unwrap();

        let table = catalog.load_table(&users).await.unwrap();
        let schema = table.current_schema().unwrap();
        assert_eq!(schema.schema_id, 1);
        assert_eq!(
            schema.field_names(),
            vec!["id", "name", "age", "_cdc_operation", "_cdc_timestamp", "_cdc_lsn"]
        );
        assert_eq!(schema.field("id").unwrap().id, 1);
        assert_eq!(schema.field("name").unwrap().id, 2);
        assert_eq!(schema.field("_cdc_lsn").unwrap().id, 5);
        assert_eq!(schema.field("age").unwrap().id, 6);
        assert_eq!(table.schemas.len(), 2);
        assert_eq!(table.snapshots.len(), 2);
        assert_eq!(table.committed_position(SOURCE_ID), Some(Position::new(0x20, 0)));

        assert!(store
            .exists(BUCKET, "warehouse/public/users/metadata/v4.metadata.json")
            .await
            .unwrap());
        let hint = store
            .download(BUCKET, "warehouse/public/users/metadata/version-hint.text")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hint, Bytes::from_static(b"4"));
    }

    #[tokio::test]
    async fn test_values_read_back_unchanged() {
        let dir = TempDir::new().unwrap();
        let (store, catalog) = disk(&dir);
        let writer = writer(store.clone(), catalog.clone());
        let seen_at = day(2024, 3, 1);

        let batch = vec![
            buffered(
                1,
                0x10,
                row(&[
                    ("big", ColumnValue::Integer(i64::MAX)),
                    ("ratio", ColumnValue::Double(0.1 + 0.2)),
                    ("active", ColumnValue::Boolean(true)),
                    ("note", "tab\tand \"quotes\"".into()),
                    ("seen", ColumnValue::Timestamp(seen_at)),
                ]),
            ),
            buffered(
                2,
                0x20,
                row(&[
                    ("big", ColumnValue::Integer(-1)),
                    ("ratio", ColumnValue::Null),
                    ("active", ColumnValue::Boolean(false)),
                    ("note", ColumnValue::Null),
                    ("seen", ColumnValue::Null),
                ]),
            ),
        ];
        let summary = writer.write_events(&batch).await.unwrap();
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.max_position, Some(Position::new(0x20, 0)));

        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        let file = table.data_files().next().unwrap();
        let bytes = store.download(BUCKET, &file.file_path).await.unwrap().unwrap();
        assert_eq!(bytes.len() as u64, file.size_bytes);
        let batches = ParquetEncoder::decode(bytes).unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);

        let big = batch
            .column_by_name("big")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(big.value(0), i64::MAX);
        assert_eq!(big.value(1), -1);

        let ratio = batch
            .column_by_name("ratio")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(ratio.value(0).to_bits(), (0.1f64 + 0.2).to_bits());
        assert!(ratio.is_null(1));

        let active = batch
            .column_by_name("active")
            .unwrap()
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert!(active.value(0));
        assert!(!active.value(1));

        let note = batch
            .column_by_name("note")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(note.value(0), "tab\tand \"quotes\"");
        assert!(note.is_null(1));

        let seen = batch
            .column_by_name("seen")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(seen.value(0), seen_at.timestamp_micros());
        assert!(seen.is_null(1));
    }

    #[tokio::test]
    async fn test_second_writer_skips_rows_below_watermark() {
        let dir = TempDir::new().unwrap();
        let (store, catalog) = disk(&dir);
        let batch = vec![
            buffered(1, 0x10, row(&[("id", ColumnValue::Integer(1))])),
            buffered(2, 0x20, row(&[("id", ColumnValue::Integer(2))])),
        ];

        writer(store.clone(), catalog.clone())
            .write_events(&batch)
            .await
            .unwrap();

        // Same batch replayed by a process that never saw the first commit
        let (store, catalog) = disk(&dir);
        let summary = writer(store, catalog.clone()).write_events(&batch).await.unwrap();
        assert_eq!(summary.events_skipped, 2);
        assert_eq!(summary.tables_committed, 0);

        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        assert_eq!(table.snapshots.len(), 1);
        assert_eq!(table.record_count(), 2);
    }

    #[tokio::test]
    async fn test_type_conflict_across_batches_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, catalog) = disk(&dir);
        let writer = writer(store.clone(), catalog.clone());

        writer
            .write_events(&[buffered(1, 0x10, row(&[("code", ColumnValue::Integer(1))]))])
            .await
            .unwrap();

        let err = writer
            .write_events(&[buffered(2, 0x20, row(&[("code", "A-17".into())]))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert!(err.to_string().contains("A-17"), "{}", err);

        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        assert_eq!(table.snapshots.len(), 1);
        assert_eq!(table.record_count(), 1);
        assert_eq!(table.current_schema().unwrap().field("code").unwrap().field_type, FieldType::Int);
        assert_eq!(table.committed_position(SOURCE_ID), Some(Position::new(0x10, 0)));

        let files = store.list(BUCKET, "warehouse/public/users/data/").await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_with_lost_acknowledgement_keeps_its_files() {
        let dir = TempDir::new().unwrap();
        let (store, catalog) = disk(&dir);
        let batch = vec![
            buffered(1, 0x10, row(&[("id", ColumnValue::Integer(1))])),
            buffered(2, 0x20, row(&[("id", ColumnValue::Integer(2))])),
        ];

        let flaky = writer(store.clone(), Arc::new(FlakyCatalog::lost_acknowledgements(catalog.clone())));
        let summary = flaky.write_events(&batch).await.unwrap();
        assert_eq!(summary.tables_committed, 1);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.max_position, Some(Position::new(0x20, 0)));

        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        let file = table.data_files().next().unwrap();
        assert!(store.exists(BUCKET, &file.file_path).await.unwrap());

        let replay = writer(store.clone(), catalog.clone()).write_events(&batch).await.unwrap();
        assert_eq!(replay.events_skipped, 2);
        assert_eq!(replay.tables_committed, 0);
        let table = catalog.load_table(&TableIdent::new("public", "users")).await.unwrap();
        assert_eq!(table.snapshots.len(), 1);
        assert_eq!(table.record_count(), 2);
    }
}
