//! Prometheus-backed metrics for the CDC pipeline
//!
//! Each [`PrometheusMetrics`] owns its registry, so several pipelines (or
//! tests) in one process do not collide on metric registration.

use super::metrics_abstraction::MetricsCollectorTrait;
use crate::{CdcError, CdcResult};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PIPELINE_STATES: [&str; 6] = ["stopped", "starting", "running", "draining", "failed", "unknown"];

pub struct PrometheusMetrics {
    registry: Registry,
    start_time: Instant,
    events_read: CounterVec,
    events_processed: Counter,
    events_skipped: Counter,
    dead_letters: Counter,
    errors: CounterVec,
    buffer_depth: Gauge,
    commit_duration: Histogram,
    replication_lag: Gauge,
    pipeline_state: GaugeVec,
    checkpoint_lsn: Gauge,
    received_lsn: Gauge,
    source_connection_status: Gauge,
    uptime: Gauge,
    build_info: GaugeVec,
}

fn registration(e: prometheus::Error) -> CdcError {
    CdcError::generic(format!("Failed to register metric: {}", e))
}

impl PrometheusMetrics {
    pub fn new() -> CdcResult<Self> {
        let registry = Registry::new();

        let events_read = CounterVec::new(
            Opts::new("pg2lake_events_read_total", "Change events persisted into the buffer"),
            &["table_name", "operation"],
        )
        .map_err(registration)?;
        let events_processed = Counter::new(
            "pg2lake_events_processed_total",
            "Change events committed to lake tables",
        )
        .map_err(registration)?;
        let events_skipped = Counter::new(
            "pg2lake_events_skipped_total",
            "Malformed change events skipped",
        )
        .map_err(registration)?;
        let dead_letters = Counter::new(
            "pg2lake_dead_letters_total",
            "Change events moved to the dead-letter sink",
        )
        .map_err(registration)?;
        let errors = CounterVec::new(
            Opts::new("pg2lake_errors_total", "Errors by kind and component"),
            &["error_kind", "component"],
        )
        .map_err(registration)?;
        let buffer_depth = Gauge::new("pg2lake_buffer_depth", "Unprocessed events in the buffer")
            .map_err(registration)?;
        let commit_duration = Histogram::with_opts(HistogramOpts::new(
            "pg2lake_commit_duration_seconds",
            "Time to encode, upload and commit one batch",
        ))
        .map_err(registration)?;
        let replication_lag = Gauge::new(
            "pg2lake_replication_lag_seconds",
            "Age of the newest event in the last committed batch",
        )
        .map_err(registration)?;
        let pipeline_state = GaugeVec::new(
            Opts::new("pg2lake_pipeline_state", "1 for the current pipeline state"),
            &["state"],
        )
        .map_err(registration)?;
        let checkpoint_lsn = Gauge::new("pg2lake_checkpoint_lsn", "Commit LSN of the last checkpoint")
            .map_err(registration)?;
        let received_lsn = Gauge::new(
            "pg2lake_current_received_lsn",
            "Last LSN received from the replication stream",
        )
        .map_err(registration)?;
        let source_connection_status = Gauge::new(
            "pg2lake_source_connection_status",
            "Connection status to the source PostgreSQL database",
        )
        .map_err(registration)?;
        let uptime = Gauge::new("pg2lake_uptime_seconds", "Application uptime in seconds")
            .map_err(registration)?;
        let build_info = GaugeVec::new(Opts::new("pg2lake_build_info", "Build information"), &["version"])
            .map_err(registration)?;

        registry.register(Box::new(events_read.clone())).map_err(registration)?;
        registry.register(Box::new(events_processed.clone())).map_err(registration)?;
        registry.register(Box::new(events_skipped.clone())).map_err(registration)?;
        registry.register(Box::new(dead_letters.clone())).map_err(registration)?;
        registry.register(Box::new(errors.clone())).map_err(registration)?;
        registry.register(Box::new(buffer_depth.clone())).map_err(registration)?;
        registry.register(Box::new(commit_duration.clone())).map_err(registration)?;
        registry.register(Box::new(replication_lag.clone())).map_err(registration)?;
        registry.register(Box::new(pipeline_state.clone())).map_err(registration)?;
        registry.register(Box::new(checkpoint_lsn.clone())).map_err(registration)?;
        registry.register(Box::new(received_lsn.clone())).map_err(registration)?;
        registry
            .register(Box::new(source_connection_status.clone()))
            .map_err(registration)?;
        registry.register(Box::new(uptime.clone())).map_err(registration)?;
        registry.register(Box::new(build_info.clone())).map_err(registration)?;

        debug!("All metrics registered successfully");
        Ok(Self {
            registry,
            start_time: Instant::now(),
            events_read,
            events_processed,
            events_skipped,
            dead_letters,
            errors,
            buffer_depth,
            commit_duration,
            replication_lag,
            pipeline_state,
            checkpoint_lsn,
            received_lsn,
            source_connection_status,
            uptime,
            build_info,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsCollectorTrait for PrometheusMetrics {
    fn record_events_read(&self, table: &str, operation: &str, count: u64) {
        self.events_read
            .with_label_values(&[table, operation])
            .inc_by(count as f64);
    }

    fn record_events_processed(&self, count: u64) {
        self.events_processed.inc_by(count as f64);
    }

    fn record_events_skipped(&self, count: u64) {
        self.events_skipped.inc_by(count as f64);
    }

    fn record_dead_letters(&self, count: u64) {
        self.dead_letters.inc_by(count as f64);
    }

    fn record_error(&self, error_kind: &str, component: &str) {
        self.errors.with_label_values(&[error_kind, component]).inc();
        warn!("Error recorded: kind={}, component={}", error_kind, component);
    }

    fn update_buffer_depth(&self, depth: usize) {
        self.buffer_depth.set(depth as f64);
    }

    fn record_commit_duration(&self, duration: Duration) {
        self.commit_duration.observe(duration.as_secs_f64());
    }

    fn update_replication_lag(&self, lag: Duration) {
        self.replication_lag.set(lag.as_secs_f64());
    }

    fn update_pipeline_state(&self, state: &str) {
        for known in PIPELINE_STATES {
            self.pipeline_state
                .with_label_values(&[known])
                .set(if known == state { 1.0 } else { 0.0 });
        }
    }

    fn record_checkpoint_lsn(&self, lsn: u64) {
        self.checkpoint_lsn.set(lsn as f64);
    }

    fn record_received_lsn(&self, lsn: u64) {
        self.received_lsn.set(lsn as f64);
    }

    fn update_source_connection_status(&self, connected: bool) {
        self.source_connection_status
            .set(if connected { 1.0 } else { 0.0 });
    }

    fn init_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }

    fn update_uptime(&self) {
        self.uptime.set(self.start_time.elapsed().as_secs() as f64);
    }

    fn get_metrics(&self) -> CdcResult<String> {
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| CdcError::generic(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| CdcError::generic(e.to_string()))
    }
}
