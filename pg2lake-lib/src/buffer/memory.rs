use super::{BufferConfig, EventBuffer, ReadinessTracker};
use crate::error::{CdcError, Result};
use crate::types::{BufferedEvent, ChangeEvent};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Non-durable buffer for tests and ephemeral pipelines
pub struct MemoryEventBuffer {
    config: BufferConfig,
    tracker: ReadinessTracker,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    events: Vec<BufferedEvent>,
}

impl MemoryEventBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let tracker = ReadinessTracker::new(config.batch_size, config.flush_interval, 0);
        Self {
            config,
            tracker,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Every stored event, processed or not
    pub async fn snapshot(&self) -> Vec<BufferedEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl EventBuffer for MemoryEventBuffer {
    async fn write(&self, event: &ChangeEvent) -> Result<i64> {
        event.validate()?;
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.events.push(BufferedEvent {
            id,
            event: event.clone(),
            created_at: Utc::now(),
            processed_at: None,
        });
        self.tracker.record_write();
        Ok(id)
    }

    fn ready(&self) -> bool {
        self.tracker.ready()
    }

    fn depth(&self) -> usize {
        self.tracker.unprocessed()
    }

    async fn flush(&self) -> Result<Vec<BufferedEvent>> {
        let inner = self.inner.lock().await;
        self.tracker.record_flush();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.processed_at.is_none() && e.event.source_id == self.config.source_id)
            .take(self.config.batch_size)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for event in inner.events.iter_mut() {
            if event.processed_at.is_none() && ids.contains(&event.id) {
                event.processed_at = Some(now);
                updated += 1;
            }
        }
        self.tracker.record_processed(updated as usize);
        Ok(updated)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| CdcError::config(format!("Invalid retention: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let mut inner = self.inner.lock().await;
        let before = inner.events.len();
        inner
            .events
            .retain(|e| !matches!(e.processed_at, Some(at) if at < cutoff));
        Ok((before - inner.events.len()) as u64)
    }
}
