//! # Huddle Server
//!
//! Presence relay between the sensing pipeline and Huddle devices.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with an explicit config file
//! HUDDLE_CONFIG=/path/to/huddle.toml huddle
//!
//! # Run with environment variables
//! HUDDLE_PORT=1948 HUDDLE_HOST=0.0.0.0 huddle
//! ```

use anyhow::{Context, Result};
use huddle_server::{metrics, Config, HuddleServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    info!("Starting Huddle server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let (mut server, mut disconnects) = HuddleServer::new(config).context("Failed to create server")?;
    server.start().await.context("Failed to start server")?;

    // The sensing pipeline is attached out of process; log what it would receive
    let forwarder = tokio::spawn(async move {
        while let Some(event) = disconnects.recv().await {
            info!(glyph = %event.identity, "Device disconnected");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.stop().await;
    drop(server);
    forwarder.abort();

    Ok(())
}
