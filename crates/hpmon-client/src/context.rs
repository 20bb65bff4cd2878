//! Application-wide client context and the per-collaborator helper.
//!
//! One [`RealtimeContext`] is created at startup and passed to whatever
//! needs live metrics. Each collaborator calls [`use_realtime`] to get a
//! [`RealtimeHandle`] that remembers the listeners it registered and removes
//! them when cleaned up or dropped.

use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::debug;

use crate::client::RealtimeClient;
use crate::config::ClientConfig;
use crate::listeners::{ClientEvent, EventKind, ListenerId};
use crate::state::ConnectionState;

/// Callback for batched metric updates.
pub type MetricCallback = Box<dyn Fn(&Map<String, Value>) + Send + Sync>;

/// Callback for connection state changes.
pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Owner of the application's realtime client.
#[derive(Debug, Clone)]
pub struct RealtimeContext {
    client: RealtimeClient,
}

impl RealtimeContext {
    /// Create the context with a WebSocket-backed client.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_client(RealtimeClient::new(config))
    }

    /// Wrap an already-built client.
    #[must_use]
    pub fn with_client(client: RealtimeClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    /// Disconnect and drop every listener.
    pub fn shutdown(&self) {
        self.client.disconnect();
        self.client.clear_listeners();
        debug!("Realtime context shut down");
    }
}

/// Connect `client` if needed and register the given callbacks.
pub fn use_realtime(
    client: &RealtimeClient,
    on_metric_update: Option<MetricCallback>,
    on_state_change: Option<StateCallback>,
) -> RealtimeHandle {
    if !client.is_connected() {
        client.connect_default();
    }

    let mut registered = Vec::new();

    if let Some(callback) = on_metric_update {
        let id = client.on(EventKind::MetricUpdate, move |event| {
            if let ClientEvent::MetricUpdate(batch) = event {
                callback(batch);
            }
            Ok(())
        });
        registered.push((EventKind::MetricUpdate, id));
    }

    if let Some(callback) = on_state_change {
        let id = client.on(EventKind::StateChange, move |event| {
            if let ClientEvent::StateChange(state) = event {
                callback(*state);
            }
            Ok(())
        });
        registered.push((EventKind::StateChange, id));
    }

    RealtimeHandle {
        client: client.clone(),
        registered: Mutex::new(registered),
    }
}

/// A collaborator's view of the shared client.
///
/// Dropping the handle removes its listeners.
#[derive(Debug)]
pub struct RealtimeHandle {
    client: RealtimeClient,
    registered: Mutex<Vec<(EventKind, ListenerId)>>,
}

impl RealtimeHandle {
    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    pub fn subscribe<I, S>(&self, metrics: I, dashboard_id: Option<&str>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client.subscribe(metrics, dashboard_id);
    }

    pub fn unsubscribe<I, S>(&self, metrics: I, dashboard_id: Option<&str>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client.unsubscribe(metrics, dashboard_id);
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Remove the listeners this handle registered. Idempotent.
    pub fn cleanup(&self) {
        let registered = std::mem::take(
            &mut *self
                .registered
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for (kind, id) in registered {
            self.client.off(kind, id);
        }
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}
