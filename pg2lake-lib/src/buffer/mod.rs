//! Durable Buffer
//!
//! Change events are persisted here before they are applied to the lake. An
//! event stays visible to [`EventBuffer::flush`] until it is explicitly marked
//! processed, so a crash between persist and commit only causes a replay.

pub mod memory;
pub mod sql;

use crate::config::Config;
use crate::error::Result;
use crate::types::{BufferedEvent, ChangeEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub use memory::MemoryEventBuffer;
pub use sql::SqlEventBuffer;

/// Buffer capability set used by the orchestrator
#[async_trait]
pub trait EventBuffer: Send + Sync {
    /// Persist one event; returns its buffer id once it is durable
    async fn write(&self, event: &ChangeEvent) -> Result<i64>;

    /// `unprocessed >= batch_size` or `flush_interval` elapsed since the last flush
    fn ready(&self) -> bool;

    /// Number of unprocessed events (backpressure input)
    fn depth(&self) -> usize;

    /// Oldest unprocessed batch for this source, without removing it
    async fn flush(&self) -> Result<Vec<BufferedEvent>>;

    /// Set `processed_at` on the given ids; returns the number of rows changed
    async fn mark_processed(&self, ids: &[i64]) -> Result<u64>;

    /// Delete events processed longer ago than `retention`
    async fn cleanup(&self, retention: Duration) -> Result<u64>;

    /// Rows skipped by `flush` because their payload could not be decoded
    fn malformed_count(&self) -> u64 {
        0
    }
}

/// Batching parameters shared by the buffer implementations
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub source_id: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl From<&Config> for BufferConfig {
    fn from(config: &Config) -> Self {
        Self {
            source_id: config.source_id.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

/// Lock-free bookkeeping behind [`EventBuffer::ready`] and [`EventBuffer::depth`]
#[derive(Debug)]
pub struct ReadinessTracker {
    batch_size: usize,
    flush_interval: Duration,
    unprocessed: AtomicUsize,
    origin: Instant,
    /// Milliseconds after `origin` of the last flush
    last_flush_ms: AtomicU64,
}

impl ReadinessTracker {
    pub fn new(batch_size: usize, flush_interval: Duration, unprocessed: usize) -> Self {
        Self {
            batch_size,
            flush_interval,
            unprocessed: AtomicUsize::new(unprocessed),
            origin: Instant::now(),
            last_flush_ms: AtomicU64::new(0),
        }
    }

    pub fn record_write(&self) {
        self.unprocessed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_processed(&self, count: usize) {
        let _ = self
            .unprocessed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            });
    }

    pub fn record_flush(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_flush_ms.store(now, Ordering::Release);
    }

    pub fn unprocessed(&self) -> usize {
        self.unprocessed.load(Ordering::Acquire)
    }

    pub fn since_last_flush(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_flush_ms.load(Ordering::Acquire)))
    }

    pub fn ready(&self) -> bool {
        self.unprocessed() >= self.batch_size || self.since_last_flush() >= self.flush_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_batch_size_boundary() {
        let tracker = ReadinessTracker::new(3, Duration::from_secs(10), 0);
        tracker.record_write();
        tracker.record_write();
        assert!(!tracker.ready());
        tracker.record_write();
        assert!(tracker.ready());
        tracker.record_processed(1);
        assert!(!tracker.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_flush_interval_boundary() {
        let tracker = ReadinessTracker::new(100, Duration::from_secs(10), 1);
        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(!tracker.ready());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.ready());

        tracker.record_flush();
        assert!(!tracker.ready());
    }

    #[test]
    fn test_processed_count_saturates() {
        let tracker = ReadinessTracker::new(10, Duration::from_secs(1), 2);
        tracker.record_processed(5);
        assert_eq!(tracker.unprocessed(), 0);
    }
}
