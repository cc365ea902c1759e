use anyhow::{Context, Result};
use clap::Parser;
use sidecar_core::HttpRegistry;
use sidecar_proxy::MetricsCollector;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
mod routes;
mod server;
mod sidecar;
mod signal;

use cli::{Cli, LogFormat};
use sidecar::Sidecar;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting sidecar v{}...", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config().context("invalid configuration")?;
    info!(
        "Service {} registering with {}, forwarding to {}",
        config.service_name, config.registry_address, config.backend_address
    );

    let registry = Arc::new(
        HttpRegistry::new(&config.registry_address, config.registry_timeout)
            .context("failed to create registry client")?,
    );
    let metrics = MetricsCollector::new().context("failed to create metrics collector")?;

    let sidecar = Sidecar::new(config, registry, metrics).context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(signal::cancel_on_signal(shutdown.clone()));

    sidecar.run(shutdown).await?;

    info!("Sidecar stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
