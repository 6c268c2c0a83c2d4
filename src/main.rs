//! Engine daemon entry point.
//!
//! Initializes logging and configuration, builds the service registry,
//! runs the startup health check (an unreachable catalog is fatal), then
//! idles until SIGINT. Exit code 0 on clean shutdown, non-zero on fatal
//! initialization failure. The HTTP/WebSocket framing layer is an external
//! collaborator; this binary only hosts the engine.

use std::path::PathBuf;

use anyhow::Context;
use ragweave::config::AppConfig;
use ragweave::core::logging;
use ragweave::core::services::Services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("RAGWEAVE_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;

    let _log_guard = logging::init(&config.logging);

    tracing::info!(version = ragweave::VERSION, "starting ragweave engine");

    let services = Services::init(config)
        .await
        .context("failed to initialize engine services")?;

    services
        .health_check()
        .await
        .context("startup health check failed")?;

    tracing::info!(
        upload_root = %services.config.files.upload_root.display(),
        graph_enabled = services.config.graph.enabled,
        "engine ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received, exiting");
    Ok(())
}
