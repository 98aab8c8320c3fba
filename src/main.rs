use pg2lake_lib::{load_config_from_env, run_cdc_app};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Main entry point: stream PostgreSQL changes into lake tables until
/// SIGINT/SIGTERM
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    tracing::info!("Starting PostgreSQL to lake CDC application");

    let config = load_config_from_env()?;

    run_cdc_app(config, env!("CARGO_PKG_VERSION")).await?;

    tracing::info!("CDC application stopped");
    Ok(())
}

/// Initialize logging
///
/// The level is controlled via `RUST_LOG`; without it the default is
/// `pg2lake=info,pg2lake_lib=info,sqlx=warn`.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pg2lake=info,pg2lake_lib=info,sqlx=warn"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized with level filtering");
}
