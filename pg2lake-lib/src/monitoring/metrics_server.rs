//! HTTP metrics server for Prometheus-compatible metrics exposition
//!
//! # Available Endpoints
//!
//! - `GET /metrics` - Prometheus-formatted metrics
//! - `GET /health` - pipeline health; 503 once the pipeline has failed

use super::metrics_abstraction::MetricsCollectorTrait;
use crate::{CdcError, CdcResult};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{body::Incoming, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reports `(healthy, detail)` for the `/health` endpoint
pub type HealthProbe = Arc<dyn Fn() -> (bool, String) + Send + Sync>;

/// Configuration for the metrics HTTP server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub port: u16,
    pub bind_address: [u8; 4],
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            port: 9187,
            bind_address: [0, 0, 0, 0],
        }
    }
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    collector: Arc<dyn MetricsCollectorTrait>,
    health: Option<HealthProbe>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, collector: Arc<dyn MetricsCollectorTrait>) -> Self {
        Self {
            config,
            collector,
            health: None,
        }
    }

    pub fn with_health_probe(mut self, probe: HealthProbe) -> Self {
        self.health = Some(probe);
        self
    }

    pub fn config(&self) -> &MetricsServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> CdcResult<TcpListener> {
        let addr = SocketAddr::from((self.config.bind_address, self.config.port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| CdcError::config(format!("Failed to bind metrics server on {}: {}", addr, e)))
    }

    /// Bind and serve until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> CdcResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> CdcResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Metrics server listening on http://{}", addr);
        }

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Metrics server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let collector = self.collector.clone();
            let health = self.health.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let collector = collector.clone();
                    let health = health.clone();
                    async move { handle(req, collector.as_ref(), health.as_ref()) }
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    if !err.is_incomplete_message() {
                        error!("Error serving connection: {:?}", err);
                    }
                }
            });
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn handle(
    req: Request<Incoming>,
    collector: &dyn MetricsCollectorTrait,
    health: Option<&HealthProbe>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            collector.update_uptime();
            match collector.get_metrics() {
                Ok(metrics) => respond(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    metrics,
                ),
                Err(err) => {
                    error!("Failed to collect metrics: {}", err);
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        "Failed to collect metrics",
                    )
                }
            }
        }
        (&Method::GET, "/health") => {
            let (healthy, detail) = health.map(|probe| probe()).unwrap_or((true, "running".to_string()));
            let body = serde_json::json!({
                "status": if healthy { "healthy" } else { "unhealthy" },
                "detail": detail,
            })
            .to_string();
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            respond(status, "application/json", body)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::metrics::PrometheusMetrics;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_metrics_server_config_default() {
        let config = MetricsServerConfig::default();
        assert_eq!(config.port, 9187);
        assert_eq!(config.bind_address, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_serves_metrics_and_health() {
        let collector = Arc::new(PrometheusMetrics::new().unwrap());
        collector.record_events_processed(7);
        let server = MetricsServer::new(
            MetricsServerConfig {
                port: 0,
                bind_address: [127, 0, 0, 1],
            },
            collector,
        )
        .with_health_probe(Arc::new(|| (false, "failed: publication missing".to_string())));

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serving = {
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve(listener, cancel).await })
        };

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("pg2lake_events_processed_total 7"));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 503"));
        assert!(health.contains("publication missing"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        serving.await.unwrap().unwrap();
    }
}
