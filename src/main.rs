//! # Dispatch Gateway - Main Entry Point
//!
//! Loads the configuration (first argument, `GATEWAY_CONFIG_PATH`, or
//! `config/gateway.yaml`) with its `GATEWAY_*` environment overrides, sets up
//! logging and metrics, and serves until SIGINT or SIGTERM.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use dispatch_gateway::observability::{init_logging, install_prometheus};
use dispatch_gateway::{Gateway, GatewayConfig, GatewayServer};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG_PATH").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = GatewayConfig::load(&config_path)
        .await
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    init_logging(&config.logging).context("failed to initialize logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "Starting gateway");

    if let Some(address) = &config.server.metrics_address {
        let address: SocketAddr = address
            .parse()
            .with_context(|| format!("invalid metrics address {}", address))?;
        install_prometheus(address).context("failed to install Prometheus exporter")?;
        info!("Metrics available on {}/metrics", address);
    }

    let gateway = Arc::new(Gateway::builder(config).build().await.context("failed to build gateway")?);

    let server = GatewayServer::new(gateway.clone());
    server.run(shutdown_signal()).await.context("gateway server failed")?;

    gateway.shutdown();
    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
