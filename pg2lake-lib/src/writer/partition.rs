//! Day partitioning on the change timestamp

use crate::types::{ChangeEvent, PartitionSpec, Transform};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Events of one batch grouped by the UTC day of their change timestamp
pub fn split_by_day<'a>(events: &[&'a ChangeEvent]) -> BTreeMap<NaiveDate, Vec<&'a ChangeEvent>> {
    let mut days: BTreeMap<NaiveDate, Vec<&'a ChangeEvent>> = BTreeMap::new();
    for event in events {
        days.entry(event.event_time.date_naive()).or_default().push(event);
    }
    days
}

/// Path segment of a day partition, e.g. `_cdc_timestamp_day=2024-03-01`
pub fn partition_path(spec: &PartitionSpec, day: NaiveDate) -> Option<String> {
    spec.fields
        .iter()
        .find(|f| f.transform == Transform::Day)
        .map(|f| format!("{}={}", f.name, day.format("%Y-%m-%d")))
}

/// Partition tuple recorded on the data file
pub fn partition_data(spec: &PartitionSpec, day: NaiveDate) -> BTreeMap<String, serde_json::Value> {
    spec.fields
        .iter()
        .filter(|f| f.transform == Transform::Day)
        .map(|f| {
            (
                f.name.clone(),
                serde_json::Value::String(day.format("%Y-%m-%d").to_string()),
            )
        })
        .collect()
}
