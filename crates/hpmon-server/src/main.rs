//! # hpmon-server
//!
//! Push server for realtime heat-pump metric and dashboard updates.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! hpmon-server
//!
//! # Run with custom config
//! hpmon-server --config /path/to/hpmon.toml
//!
//! # Run with environment variables
//! HPMON_PORT=8080 HPMON_HOST=0.0.0.0 hpmon-server
//!
//! # Push readings
//! curl -X POST localhost:8080/broadcast/metrics -d '{"temp_outside": 4.5}' \
//!      -H 'content-type: application/json'
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hpmon_server=debug,hpmon_hub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path()? {
        Some(path) => config::Config::layered(Some(&path))?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting hpmon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

/// Path given with `--config`, if any.
fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => return Ok(Some(PathBuf::from(shellexpand::tilde(&path).as_ref()))),
                None => bail!("--config requires a path"),
            },
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(None)
}
