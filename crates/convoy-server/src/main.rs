//! # Convoy Server
//!
//! Group journey synchronization server: REST for journey management and
//! tracking, WebSocket rooms for live positions.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! convoy
//!
//! # Run with a config file in the working directory
//! cp convoy.example.toml convoy.toml && convoy
//!
//! # Override single settings through the environment
//! CONVOY__PORT=8080 CONVOY__TRACKING__SPEED_CEILING_KMH=120 convoy
//! ```

mod config;
mod handlers;
mod http;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy=debug,convoy_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Convoy server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
