//! edgeway gateway
//!
//! Loads the resource file, provisions listeners and backends, then follows
//! changes to the file until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgeway_gateway::config::Config;
use edgeway_gateway::reload::{load_into, FileReloader};
use edgeway_gateway::GatewayRuntime;
use edgeway_resources::ResourceStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EDGEWAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("TLS crypto provider already installed");
    }

    info!("Starting edgeway gateway");
    info!(
        resources = %config.resources_path.display(),
        reload_poll_interval_ms = config.reload_poll_interval.as_millis() as u64,
        rebuild_debounce_ms = config.rebuild_debounce.as_millis() as u64,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let store = Arc::new(ResourceStore::new());
    load_into(&store, &config.resources_path)?;

    let (runtime, failed) =
        GatewayRuntime::start_default(Arc::clone(&store), config.runtime_options()).await;
    for failure in &failed {
        error!(listener = %failure.id, error = %failure.error, "Listener failed to start");
    }

    let reloader = FileReloader::new(
        config.resources_path.clone(),
        Arc::clone(&store),
        config.reload_poll_interval,
    );
    let reload_task = tokio::spawn(reloader.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    reload_task.abort();
    runtime.shutdown().await;
    Ok(())
}
