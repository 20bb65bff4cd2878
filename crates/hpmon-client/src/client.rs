//! The realtime update client.
//!
//! [`RealtimeClient`] owns one logical connection to the push server. It
//! keeps the subscription set across reconnects, merges bursts of
//! `metric_update` frames into one notification per debounce window, and
//! reports everything to listeners registered with [`RealtimeClient::on`].
//!
//! ```text
//!  Socket driver ──SocketEvent──▶ event pump ──▶ state / buffer ──▶ listeners
//!        ▲                                            │
//!        └──────── subscribe / unsubscribe / ping ◀───┘ (public API)
//! ```
//!
//! Background tasks hold weak references; dropping the last clone of the
//! client closes the socket and stops them.

use hpmon_protocol::{ClientFrame, MetricUpdate, ServerFrame, PROTOCOL_VERSION};
use hpmon_transport::{FallbackTransport, Socket, SocketEvent, Transport, WebSocketTransport};
use indexmap::IndexSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::UpdateBuffer;
use crate::config::{ClientConfig, ConnectOptions};
use crate::listeners::{ClientEvent, EventKind, ListenerError, ListenerId, ListenerRegistry};
use crate::metrics;
use crate::state::ConnectionState;

/// Reconnecting realtime client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transports: Vec<Arc<dyn Transport>>,
    listeners: ListenerRegistry,
    shared: Mutex<Shared>,
}

/// Mutable client state. Never held while listeners run.
#[derive(Default)]
struct Shared {
    state: ConnectionState,
    reconnect_attempts: u32,
    subscriptions: IndexSet<String>,
    dashboard_id: Option<String>,
    buffer: UpdateBuffer,
    flush: Option<JoinHandle<()>>,
    socket: Option<Socket>,
    /// Bumped whenever the socket is replaced or closed.
    generation: u64,
}

impl Shared {
    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!(from = %self.state, to = %state, "State transition");
        }
        self.state = state;
        metrics::record_transition(state);
    }

    /// The socket, if it currently has a live connection.
    fn live_socket(&self) -> Option<&Socket> {
        self.socket.as_ref().filter(|s| s.is_connected())
    }
}

impl RealtimeClient {
    /// Create a client using the built-in WebSocket transport.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let websocket: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(config.websocket()));
        Self::with_transports(config, vec![websocket])
    }

    /// Create a client with an explicit set of transports.
    ///
    /// The transport preference list picks from these by kind.
    #[must_use]
    pub fn with_transports(config: ClientConfig, transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transports,
                listeners: ListenerRegistry::new(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        self.inner.listeners.emit(&event);
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect using the configured URL and default options.
    pub fn connect_default(&self) {
        self.connect(None, ConnectOptions::default());
    }

    /// Open the connection.
    ///
    /// Does nothing if already connected or connecting. Failures show up
    /// as [`ConnectionState::Error`] and in the logs, never as a return value.
    pub fn connect(&self, url: Option<&str>, options: ConnectOptions) {
        let generation = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::Connected => {
                    warn!("Realtime client already connected");
                    return;
                }
                ConnectionState::Connecting => {
                    debug!("Realtime client already connecting");
                    return;
                }
                _ => {}
            }

            if Handle::try_current().is_err() {
                shared.set_state(ConnectionState::Error);
                drop(shared);
                error!("No async runtime available to drive the realtime connection");
                self.emit(ClientEvent::StateChange(ConnectionState::Error));
                return;
            }

            if let Some(previous) = shared.socket.take() {
                debug!("Closing previous socket");
                previous.close();
            }
            shared.generation += 1;
            shared.set_state(ConnectionState::Connecting);
            shared.generation
        };
        self.emit(ClientEvent::StateChange(ConnectionState::Connecting));

        let config = &self.inner.config;
        let url = url.unwrap_or(config.url.as_str()).to_string();
        let transport =
            FallbackTransport::with_preference(&self.inner.transports, &options.transports(config));
        let policy = options.policy(config);

        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let mut shared = self.lock();
        if shared.generation != generation {
            debug!("Connect superseded before the socket was opened");
            return;
        }
        info!(url = %url, transports = ?transport.kinds(), "Connecting");
        let (socket, events) = Socket::spawn(&runtime, url, Arc::new(transport), policy);
        shared.socket = Some(socket);
        drop(shared);

        runtime.spawn(pump(Arc::downgrade(&self.inner), generation, events));
    }

    /// Close the connection and forget all subscriptions.
    ///
    /// A later `connect` starts with an empty subscription set.
    pub fn disconnect(&self) {
        let socket = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.set_state(ConnectionState::Disconnected);
            shared.subscriptions.clear();
            shared.dashboard_id = None;
            shared.socket.take()
        };
        if let Some(socket) = socket {
            socket.close();
            info!("Disconnected");
        }
        self.emit(ClientEvent::StateChange(ConnectionState::Disconnected));
    }

    /// Add metrics to the subscription set and optionally set the dashboard.
    ///
    /// When connected, the server is sent a request for exactly these
    /// metrics; otherwise they are sent on the next connect.
    pub fn subscribe<I, S>(&self, metrics: I, dashboard_id: Option<&str>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metrics: Vec<String> = metrics.into_iter().map(Into::into).collect();
        let dashboard_id = dashboard_id.filter(|id| !id.is_empty());

        let mut shared = self.lock();
        shared.subscriptions.extend(metrics.iter().cloned());
        if let Some(id) = dashboard_id {
            shared.dashboard_id = Some(id.to_string());
        }

        match shared.live_socket() {
            Some(socket) => {
                debug!(metrics = ?metrics, dashboard = ?dashboard_id, "Subscribing");
                socket.send(ClientFrame::subscribe(metrics, dashboard_id));
            }
            None => debug!(metrics = ?metrics, "Not connected; subscription recorded locally"),
        }
    }

    /// Remove metrics from the subscription set.
    ///
    /// The stored dashboard id is left alone; `dashboard_id` is only
    /// forwarded to the server.
    pub fn unsubscribe<I, S>(&self, metrics: I, dashboard_id: Option<&str>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metrics: Vec<String> = metrics.into_iter().map(Into::into).collect();

        let mut shared = self.lock();
        for metric in &metrics {
            shared.subscriptions.shift_remove(metric);
        }

        if let Some(socket) = shared.live_socket() {
            debug!(metrics = ?metrics, dashboard = ?dashboard_id, "Unsubscribing");
            socket.send(ClientFrame::unsubscribe(metrics, dashboard_id));
        }
    }

    /// Send a ping if connected.
    pub fn ping(&self) {
        if let Some(socket) = self.lock().live_socket() {
            socket.send(ClientFrame::ping());
        }
    }

    /// Register a listener.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.inner.listeners.on(kind, callback)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.listeners.off(kind, id)
    }

    /// Remove every listener.
    pub fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    /// Number of listeners registered for a kind.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Copy of the current subscription set, in insertion order.
    #[must_use]
    pub fn subscriptions(&self) -> IndexSet<String> {
        self.lock().subscriptions.clone()
    }

    #[must_use]
    pub fn dashboard_id(&self) -> Option<String> {
        self.lock().dashboard_id.clone()
    }

    /// Current reconnect attempt number; zero while connected.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Apply a state change from the socket of `generation`.
    ///
    /// Returns `false` if that socket has been replaced or closed.
    fn transition(&self, generation: u64, state: ConnectionState, attempts: Option<u32>) -> bool {
        {
            let mut shared = self.lock();
            if shared.generation != generation {
                return false;
            }
            shared.set_state(state);
            if let Some(n) = attempts {
                shared.reconnect_attempts = n;
            }
        }
        self.emit(ClientEvent::StateChange(state));
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn handle_socket_event(&self, generation: u64, event: SocketEvent) -> bool {
        match event {
            SocketEvent::Connect => {
                if !self.transition(generation, ConnectionState::Connected, Some(0)) {
                    return false;
                }
                self.resubscribe(generation);
                true
            }
            SocketEvent::Disconnect { reason } => {
                info!(reason = %reason, "Connection lost");
                self.transition(generation, ConnectionState::Disconnected, None)
            }
            SocketEvent::ReconnectAttempt(n) => {
                debug!(attempt = n, "Reconnect attempt");
                self.transition(generation, ConnectionState::Reconnecting, Some(n))
            }
            SocketEvent::Reconnect(n) => {
                info!(attempts = n, "Reconnected");
                self.transition(generation, ConnectionState::Connected, Some(0))
            }
            SocketEvent::ReconnectFailed => {
                if !self.is_current(generation) {
                    return false;
                }
                error!("Realtime reconnection failed");
                self.transition(generation, ConnectionState::Error, None)
            }
            SocketEvent::Error(e) => {
                if !self.is_current(generation) {
                    return false;
                }
                error!(error = %e, "Realtime connection error");
                self.transition(generation, ConnectionState::Error, None)
            }
            SocketEvent::Frame(frame) => {
                if !self.is_current(generation) {
                    return false;
                }
                self.handle_frame(frame);
                true
            }
        }
    }

    /// Re-send the whole subscription set after a (re)connect.
    fn resubscribe(&self, generation: u64) {
        let shared = self.lock();
        if shared.generation != generation {
            return;
        }
        if shared.subscriptions.is_empty() && shared.dashboard_id.is_none() {
            return;
        }
        if let Some(socket) = shared.socket.as_ref() {
            debug!(
                metrics = shared.subscriptions.len(),
                dashboard = ?shared.dashboard_id,
                "Restoring subscriptions"
            );
            socket.send(ClientFrame::subscribe(
                shared.subscriptions.iter().cloned(),
                shared.dashboard_id.as_deref(),
            ));
        }
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Connected(greeting) => {
                debug!(sid = ?greeting.sid, status = %greeting.status, "Server greeting");
                if let Some(version) = greeting.version {
                    if !PROTOCOL_VERSION.is_compatible_with(&version) {
                        warn!(
                            server = %version,
                            client = %PROTOCOL_VERSION,
                            "Server speaks an incompatible protocol version"
                        );
                    }
                }
            }
            ServerFrame::MetricUpdate(update) => self.buffer_update(update),
            ServerFrame::DashboardUpdate(data) => self.emit(ClientEvent::DashboardUpdate(data)),
            ServerFrame::Subscribed(ack) => self.emit(ClientEvent::Subscribed(ack)),
            ServerFrame::Unsubscribed(ack) => self.emit(ClientEvent::Unsubscribed(ack)),
            ServerFrame::Pong(pong) => self.emit(ClientEvent::Pong(pong)),
            ServerFrame::Other { event, .. } => {
                debug!(event = %event, "Ignoring unknown server event");
            }
        }
    }

    /// Merge an update and make sure a flush is scheduled.
    fn buffer_update(&self, update: MetricUpdate) {
        let mut shared = self.lock();
        let written = shared.buffer.merge(update);
        metrics::record_buffered(written);

        if shared.flush.is_none() {
            let window = self.inner.config.debounce();
            trace!(window_ms = window.as_millis() as u64, "Scheduling flush");
            shared.flush = Some(tokio::spawn(flush_after(
                Arc::downgrade(&self.inner),
                window,
            )));
        }
    }

    fn flush(&self) {
        let batch = {
            let mut shared = self.lock();
            shared.flush = None;
            shared.buffer.take()
        };
        if batch.is_empty() {
            return;
        }

        trace!(metrics = batch.len(), "Flushing metric updates");
        metrics::record_flush(batch.len());
        self.emit(ClientEvent::MetricUpdate(batch));
    }
}

impl Default for RealtimeClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("RealtimeClient")
            .field("state", &shared.state)
            .field("subscriptions", &shared.subscriptions)
            .field("dashboard_id", &shared.dashboard_id)
            .finish_non_exhaustive()
    }
}

/// Feed socket events from one socket generation into the client.
async fn pump(inner: Weak<Inner>, generation: u64, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let client = RealtimeClient { inner };
        if !client.handle_socket_event(generation, event) {
            trace!(generation, "Socket superseded, stopping event pump");
            break;
        }
    }
}

async fn flush_after(inner: Weak<Inner>, window: Duration) {
    tokio::time::sleep(window).await;
    if let Some(inner) = inner.upgrade() {
        RealtimeClient { inner }.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_while_disconnected_is_local() {
        let client = RealtimeClient::default();
        client.subscribe(["temp_outside", "temp_flow"], Some("dash1"));
        client.subscribe(["temp_flow"], None);

        let subs: Vec<String> = client.subscriptions().into_iter().collect();
        assert_eq!(subs, vec!["temp_outside", "temp_flow"]);
        assert_eq!(client.dashboard_id().as_deref(), Some("dash1"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unsubscribe_keeps_dashboard() {
        let client = RealtimeClient::default();
        client.subscribe(["a", "b", "c"], Some("main"));
        client.unsubscribe(["b", "missing"], Some("main"));

        let subs: Vec<String> = client.subscriptions().into_iter().collect();
        assert_eq!(subs, vec!["a", "c"]);
        assert_eq!(client.dashboard_id().as_deref(), Some("main"));
    }

    #[test]
    fn test_connect_without_runtime_is_error_state() {
        let client = RealtimeClient::default();
        client.connect_default();
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[test]
    fn test_disconnect_clears_subscriptions() {
        let client = RealtimeClient::default();
        client.subscribe(["temp_flow"], Some("main"));
        client.disconnect();

        assert!(client.subscriptions().is_empty());
        assert_eq!(client.dashboard_id(), None);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_ping_while_disconnected_is_noop() {
        let client = RealtimeClient::default();
        client.ping();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
