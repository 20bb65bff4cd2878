//! # hpmon-tail
//!
//! Follow live metric updates from an hpmon server.
//!
//! ## Usage
//!
//! ```bash
//! # Subscribe to what the [client.tail] table of hpmon.toml lists
//! hpmon-tail
//!
//! # Override the server and metrics
//! HPMON_URL=ws://heatpump.local:8080/ws hpmon-tail temp_outside temp_flow
//! ```

use anyhow::{Context, Result};
use hpmon_client::{ClientConfig, ClientEvent, EventKind, RealtimeContext};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hpmon_client=info,hpmon_tail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ClientConfig::load().context("Failed to load client configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        config.tail.metrics = args;
    }
    let tail = config.tail.clone();

    hpmon_client::metrics::describe();

    let context = RealtimeContext::new(config);
    let client = context.client();

    client.on(EventKind::StateChange, |event| {
        if let ClientEvent::StateChange(state) = event {
            info!(state = %state, "Connection state");
        }
        Ok(())
    });
    client.on(EventKind::MetricUpdate, |event| {
        if let ClientEvent::MetricUpdate(batch) = event {
            for (metric, value) in batch {
                info!(metric = %metric, value = %value, "Metric update");
            }
        }
        Ok(())
    });
    client.on(EventKind::DashboardUpdate, |event| {
        if let ClientEvent::DashboardUpdate(data) = event {
            info!(data = %data, "Dashboard update");
        }
        Ok(())
    });
    client.on(EventKind::Subscribed, |event| {
        if let ClientEvent::Subscribed(ack) = event {
            info!(metrics = ?ack.metrics, dashboard = ?ack.dashboard_id, "Subscribed");
        }
        Ok(())
    });

    client.subscribe(tail.metrics.iter().map(String::as_str), tail.dashboard_id.as_deref());
    info!(url = %client.config().url, metrics = ?tail.metrics, "Starting hpmon-tail");
    client.connect_default();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    context.shutdown();

    Ok(())
}
