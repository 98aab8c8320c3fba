//! Monitoring and Metrics Module
//!
//! Metrics collection goes through [`MetricsCollectorTrait`]; the prometheus
//! collector and its HTTP exposition server exist only with the `metrics`
//! feature.

pub mod metrics_abstraction;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "metrics")]
pub mod metrics_server;

pub use metrics_abstraction::{default_collector, MetricsCollectorTrait, NoopMetrics, ProcessingTimer};

#[cfg(feature = "metrics")]
pub use metrics::PrometheusMetrics;

#[cfg(feature = "metrics")]
pub use metrics_server::{HealthProbe, MetricsServer, MetricsServerConfig};
