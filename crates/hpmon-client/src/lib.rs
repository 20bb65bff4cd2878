//! # hpmon-client
//!
//! Realtime metric updates for the heat-pump dashboard.
//!
//! [`RealtimeClient`] keeps one connection to the hpmon push server alive,
//! restores subscriptions after every reconnect and batches bursts of
//! metric updates into one notification per debounce window.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hpmon_client::{ClientConfig, ClientEvent, EventKind, RealtimeContext};
//!
//! # async fn run() {
//! let context = RealtimeContext::new(ClientConfig::default());
//! let client = context.client();
//!
//! client.on(EventKind::MetricUpdate, |event| {
//!     if let ClientEvent::MetricUpdate(batch) = event {
//!         for (metric, value) in batch {
//!             println!("{metric} = {value}");
//!         }
//!     }
//!     Ok(())
//! });
//!
//! client.subscribe(["temp_outside", "temp_flow"], Some("main"));
//! client.connect_default();
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod listeners;
pub mod metrics;
pub mod state;

pub use buffer::UpdateBuffer;
pub use client::RealtimeClient;
pub use config::{ClientConfig, ConfigError, ConnectOptions, ReconnectionConfig, TailConfig};
pub use context::{use_realtime, MetricCallback, RealtimeContext, RealtimeHandle, StateCallback};
pub use listeners::{ClientEvent, EventKind, Listener, ListenerError, ListenerId, ListenerRegistry};
pub use state::ConnectionState;

pub use hpmon_transport::TransportKind;
