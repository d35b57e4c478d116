//! # Relay Server
//!
//! Realtime fan-out router.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file from the default search path
//! RELAY__AUTH__JWT_SECRET=change-me relay
//!
//! # Run with a specific config file
//! relay /path/to/relay.toml
//!
//! # Override any setting from the environment
//! RELAY__PORT=9000 RELAY__STORE__BACKEND=redis relay
//! ```

use anyhow::Result;
use relay_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
