//! UA Bouncer Server
//!
//! Loads configuration, sets up logging, prepares every pipeline handler and
//! serves HTTP until interrupted.

use anyhow::Context;
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use ua_bouncer::{BouncerConfig, BouncerServer, HandlerConfig};

/// Main entry point for the UA bouncer
///
/// # Usage
/// ```bash
/// # Start with default config (ua_bouncer.yaml)
/// ua-bouncer
///
/// # Start with custom config
/// ua-bouncer /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting UA bouncer");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "ua_bouncer.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = BouncerConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    for handler in &config.handlers {
        match handler {
            HandlerConfig::Device(device) => info!(
                "  - device handler '{}': cookie {}, prefix {:?}, ttl {}s, backend {:?}",
                device.name,
                device.cookie_name,
                device.cache_key_prefix,
                device.cache_entry_ttl,
                device.cache_backend
            ),
            HandlerConfig::Static(fixed) => info!("  - static handler '{}'", fixed.name),
        }
    }
    info!("  - Purge enabled: {}", config.admin.enabled);
    info!("  - Metrics enabled: {}", config.metrics_enabled);

    let server = BouncerServer::from_config(&config)
        .await
        .context("pipeline setup failed")?;
    let server = Arc::new(server);

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;

    Arc::clone(&server)
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    server.shutdown().await?;
    info!("UA bouncer stopped");
    Ok(())
}
