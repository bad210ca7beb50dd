//! # Tandem Server
//!
//! Realtime coordination server for the Tandem skill exchange: presence,
//! live pub/sub, the swap lifecycle, conversations and notifications.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tandem
//!
//! # Run with environment variables
//! TANDEM_PORT=8080 TANDEM_HOST=0.0.0.0 tandem
//! ```
//!
//! Configuration is read from `tandem.toml` (working directory,
//! `/etc/tandem/` or `~/.config/tandem/`) when present.

mod config;
mod http;
mod metrics;
mod state;
mod ws;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    // Wire services and start the notification dispatcher
    let (state, bus_rx) = state::AppState::new(config);
    tokio::spawn(state.dispatcher.clone().run(bus_rx));

    // Start the server
    http::run_server(state).await?;

    Ok(())
}
