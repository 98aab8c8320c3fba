//! CDC Application Runner
//!
//! Wires one pipeline from a [`Config`]: SQL buffer, checkpoint and
//! dead-letter stores on one SQLite pool, a local object store with the
//! object-store catalog, the replication source, the metrics server and
//! signal handling.

use crate::buffer::{BufferConfig, SqlEventBuffer};
use crate::checkpoint::{CheckpointManager, SqlCheckpointStore};
use crate::config::Config;
use crate::dead_letter::SqlDeadLetterSink;
use crate::monitoring::{default_collector, MetricsCollectorTrait};
use crate::pipeline::{Pipeline, PipelineConfig, PipelineHandle};
use crate::schema::{SchemaBuilder, TypeHints};
use crate::source::{ChangeSource, LsnFeedback};
use crate::store::open_sqlite_pool;
use crate::writer::{LocalObjectStore, ObjectStoreCatalog, TableWriter, WriterConfig};
use crate::CdcResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for the CDC application
#[derive(Debug, Clone)]
pub struct CdcAppConfig {
    pub cdc_config: Config,
    /// Serve `/metrics` and `/health` on this port (metrics feature only)
    pub metrics_port: Option<u16>,
    /// Application version for metrics
    pub version: String,
}

impl CdcAppConfig {
    pub fn new(cdc_config: Config) -> Self {
        Self {
            cdc_config,
            metrics_port: None,
            version: "unknown".to_string(),
        }
    }

    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }
}

/// High-level CDC application runner
pub struct CdcApp {
    config: CdcAppConfig,
    pipeline: Pipeline,
    handle: PipelineHandle,
    metrics: Arc<dyn MetricsCollectorTrait>,
}

impl CdcApp {
    /// Build the application with the PostgreSQL replication source
    pub async fn new(config: CdcAppConfig) -> CdcResult<Self> {
        let feedback = Arc::new(LsnFeedback::new());
        let source = postgres_source(&config.cdc_config, feedback.clone()).await?;
        Self::with_source(config, source, feedback).await
    }

    /// Build the application around an already constructed change source.
    ///
    /// `feedback` must be the instance the source reports upstream.
    pub async fn with_source(
        config: CdcAppConfig,
        source: Box<dyn ChangeSource>,
        feedback: Arc<LsnFeedback>,
    ) -> CdcResult<Self> {
        let cdc = &config.cdc_config;
        cdc.validate()?;
        tracing::info!("Initializing CDC pipeline for source {}", cdc.source_id);

        let metrics = default_collector()?;
        metrics.init_build_info(&config.version);

        let pool = open_sqlite_pool(&cdc.buffer_url).await?;
        let buffer = Arc::new(SqlEventBuffer::new(pool.clone(), BufferConfig::from(cdc)).await?);
        let checkpoints = CheckpointManager::new(
            Arc::new(SqlCheckpointStore::new(pool.clone())),
            cdc.source_id.clone(),
        );
        let dead_letters = Arc::new(SqlDeadLetterSink::new(pool));

        let store = Arc::new(LocalObjectStore::new(cdc.warehouse_path.clone()));
        let catalog = Arc::new(ObjectStoreCatalog::new(
            store.clone(),
            cdc.warehouse_bucket.clone(),
            cdc.warehouse_prefix.clone(),
        ));
        let hints = Arc::new(TypeHints::new());
        let writer = Arc::new(TableWriter::new(
            WriterConfig::from(cdc),
            catalog,
            store,
            SchemaBuilder::new(hints.clone()),
        ));

        let pipeline = Pipeline::builder(PipelineConfig::from(cdc))
            .source(source)
            .buffer(buffer)
            .checkpoints(checkpoints)
            .writer(writer)
            .dead_letters(dead_letters)
            .metrics(metrics.clone())
            .type_hints(hints)
            .feedback(feedback)
            .build()?;
        let handle = pipeline.handle();

        tracing::info!("CDC pipeline initialized successfully");
        Ok(Self {
            config,
            pipeline,
            handle,
            metrics,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn get_metrics(&self) -> CdcResult<String> {
        self.metrics.get_metrics()
    }

    /// Run until SIGINT/SIGTERM (drains, then stops) or an unrecoverable error
    pub async fn run(self) -> CdcResult<()> {
        let CdcApp {
            config,
            pipeline,
            handle,
            metrics,
        } = self;
        let cancel = handle.cancellation_token();

        let server_cancel = CancellationToken::new();
        #[cfg(feature = "metrics")]
        let metrics_server = config.metrics_port.map(|port| {
            tracing::info!("Starting metrics server on port {}", port);
            let probe_handle = handle.clone();
            let server = crate::monitoring::MetricsServer::new(
                crate::monitoring::MetricsServerConfig {
                    port,
                    ..Default::default()
                },
                metrics.clone(),
            )
            .with_health_probe(Arc::new(move || probe_handle.health()));
            let server_cancel = server_cancel.clone();
            tokio::spawn(async move { server.start(server_cancel).await })
        });
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (&config.metrics_port, &metrics);
            tracing::info!("Metrics feature disabled, not starting metrics server");
        }

        let shutdown_handler = tokio::spawn(setup_shutdown_handler(cancel.clone()));

        tracing::info!("Starting CDC replication stream");
        let result = pipeline.run().await;

        shutdown_handler.abort();
        server_cancel.cancel();
        #[cfg(feature = "metrics")]
        if let Some(server) = metrics_server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Metrics server failed: {}", e),
                Err(e) => tracing::error!("Metrics server task failed: {:?}", e),
            }
        }

        match &result {
            Ok(()) => tracing::info!("CDC replication stopped successfully"),
            Err(e) => tracing::error!("CDC replication failed: {}", e),
        }
        result
    }
}

/// Create and run the application from a configuration
pub async fn run_cdc_app(config: Config, version: &str) -> CdcResult<()> {
    let metrics_port = config.metrics_port;
    let app_config = CdcAppConfig::new(config)
        .with_metrics_port(metrics_port)
        .with_version(version);
    CdcApp::new(app_config).await?.run().await
}

#[cfg(feature = "postgres")]
async fn postgres_source(config: &Config, feedback: Arc<LsnFeedback>) -> CdcResult<Box<dyn ChangeSource>> {
    use crate::source::{PgWalTransport, PostgresAdmin, PostgresSource, SourceConfig};

    let mut admin = PostgresAdmin::new(&config.source_connection_string);
    admin.connect().await?;
    let verified = admin.verify_publication(&config.publication_name).await;
    admin.close();
    verified?;

    let transport = PgWalTransport::new(&config.source_connection_string);
    Ok(Box::new(PostgresSource::new(
        transport,
        SourceConfig::from(config),
        feedback,
    )))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_source(_config: &Config, _feedback: Arc<LsnFeedback>) -> CdcResult<Box<dyn ChangeSource>> {
    Err(crate::CdcError::unsupported(
        "pg2lake was built without the `postgres` feature; rebuild with --features postgres",
    ))
}

/// Cancel `shutdown_token` on SIGTERM or SIGINT
async fn setup_shutdown_handler(shutdown_token: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());
        let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers ({}), falling back to Ctrl+C", e);
                if signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
        }
        shutdown_token.cancel();
    }

    #[cfg(windows)]
    {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
        }
    }
}
