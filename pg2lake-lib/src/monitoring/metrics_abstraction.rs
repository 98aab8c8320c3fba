//! Metrics Abstraction Layer
//!
//! The pipeline reports observations through [`MetricsCollectorTrait`] and
//! never touches a registry directly. With the `metrics` feature the
//! collector is backed by prometheus; without it every call is a no-op.

use crate::CdcResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observations emitted by the pipeline. Implementations are internally
/// synchronized and shared as `Arc<dyn MetricsCollectorTrait>`.
pub trait MetricsCollectorTrait: Send + Sync {
    /// Change events taken from the source and persisted in the buffer
    fn record_events_read(&self, table: &str, operation: &str, count: u64);

    /// Events committed to the lake and marked processed
    fn record_events_processed(&self, count: u64);

    /// Events skipped as malformed
    fn record_events_skipped(&self, count: u64);

    fn record_dead_letters(&self, count: u64);

    fn record_error(&self, error_kind: &str, component: &str);

    fn update_buffer_depth(&self, depth: usize);

    /// Duration of one write + catalog commit cycle
    fn record_commit_duration(&self, duration: Duration);

    /// Age of the newest event in the last committed batch
    fn update_replication_lag(&self, lag: Duration);

    fn update_pipeline_state(&self, state: &str);

    fn record_checkpoint_lsn(&self, lsn: u64);

    fn record_received_lsn(&self, lsn: u64);

    fn update_source_connection_status(&self, connected: bool);

    fn init_build_info(&self, version: &str);

    fn update_uptime(&self);

    /// Metrics in Prometheus text format
    fn get_metrics(&self) -> CdcResult<String>;
}

/// Collector that drops every observation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollectorTrait for NoopMetrics {
    fn record_events_read(&self, _table: &str, _operation: &str, _count: u64) {}

    fn record_events_processed(&self, _count: u64) {}

    fn record_events_skipped(&self, _count: u64) {}

    fn record_dead_letters(&self, _count: u64) {}

    fn record_error(&self, _error_kind: &str, _component: &str) {}

    fn update_buffer_depth(&self, _depth: usize) {}

    fn record_commit_duration(&self, _duration: Duration) {}

    fn update_replication_lag(&self, _lag: Duration) {}

    fn update_pipeline_state(&self, _state: &str) {}

    fn record_checkpoint_lsn(&self, _lsn: u64) {}

    fn record_received_lsn(&self, _lsn: u64) {}

    fn update_source_connection_status(&self, _connected: bool) {}

    fn init_build_info(&self, _version: &str) {}

    fn update_uptime(&self) {}

    fn get_metrics(&self) -> CdcResult<String> {
        Ok("# Metrics not available - metrics feature disabled\n".to_string())
    }
}

/// Times one commit cycle
pub struct ProcessingTimer {
    start_time: Instant,
}

impl ProcessingTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn finish(self, collector: &dyn MetricsCollectorTrait) -> Duration {
        let duration = self.start_time.elapsed();
        collector.record_commit_duration(duration);
        duration
    }
}

/// Collector for the enabled feature set
#[cfg(feature = "metrics")]
pub fn default_collector() -> CdcResult<Arc<dyn MetricsCollectorTrait>> {
    Ok(Arc::new(crate::monitoring::metrics::PrometheusMetrics::new()?))
}

/// Collector for the enabled feature set
#[cfg(not(feature = "metrics"))]
pub fn default_collector() -> CdcResult<Arc<dyn MetricsCollectorTrait>> {
    tracing::debug!("Metrics feature disabled - using no-op collector");
    Ok(Arc::new(NoopMetrics))
}
