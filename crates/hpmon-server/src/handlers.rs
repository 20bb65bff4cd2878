//! Connection handlers for the hpmon server.
//!
//! This module handles the WebSocket connection lifecycle, the inbound
//! `subscribe` / `unsubscribe` / `ping` events and the HTTP endpoints the
//! heat-pump poller uses to push readings.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hpmon_hub::{Hub, HubConfig, HubStats, Joined, Left, RoomKey, RoomReceiver};
use hpmon_protocol::{
    codec, ClientFrame, Connected, Encoding, FrameCodec, ServerFrame, WireMessage,
    PROTOCOL_VERSION,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

type Sender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Room membership and fan-out.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    /// Open WebSocket connections.
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub_config = HubConfig {
            max_rooms: config.limits.max_rooms,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            room_capacity: config.limits.room_capacity,
        };

        Self {
            hub: Hub::with_config(hub_config),
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot(Arc<AppState>);

impl ConnectionSlot {
    /// Reserve a slot, or `None` when `max_connections` are already held.
    fn reserve(state: &Arc<AppState>) -> Option<Self> {
        let previous = state.active.fetch_add(1, Ordering::AcqRel);
        if previous >= state.config.limits.max_connections {
            state.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(state.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP/WebSocket router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/broadcast/metrics", post(broadcast_metrics_handler))
        .route("/broadcast/dashboard/:id", post(broadcast_dashboard_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(addr).await?;

    info!("hpmon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
    }))
}

/// Subscription statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// Push a map of metric readings to their subscribers.
async fn broadcast_metrics_handler(
    State(state): State<Arc<AppState>>,
    Json(values): Json<Map<String, Value>>,
) -> Json<Value> {
    let delivered = state.hub.broadcast_metrics(&values);
    metrics::record_broadcast("metrics");
    debug!(total = values.len(), delivered, "Metrics broadcast");
    Json(json!({ "delivered": delivered }))
}

/// Push an opaque update to everyone watching a dashboard.
async fn broadcast_dashboard_handler(
    State(state): State<Arc<AppState>>,
    Path(dashboard_id): Path<String>,
    Json(data): Json<Value>,
) -> Json<Value> {
    let delivered = state.hub.broadcast_dashboard(&dashboard_id, data);
    metrics::record_broadcast("dashboard");
    debug!(dashboard = %dashboard_id, delivered, "Dashboard broadcast");
    Json(json!({ "delivered": delivered }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = ConnectionSlot::reserve(&state) else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

fn next_connection_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn_{:x}_{}", nanos, counter)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Per-connection state shared by the frame handlers.
struct Session {
    id: String,
    codec: FrameCodec,
    forwarders: HashMap<RoomKey, JoinHandle<()>>,
    room_tx: mpsc::UnboundedSender<Arc<ServerFrame>>,
}

impl Session {
    /// Forward a room's broadcasts into this connection's outbound queue.
    fn forward(&mut self, key: RoomKey, mut rx: RoomReceiver) {
        let tx = self.room_tx.clone();
        let connection = self.id.clone();
        let room = key.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection = %connection, room = %room, skipped, "Slow consumer skipped frames");
                    }
                }
            }
        });
        if let Some(previous) = self.forwarders.insert(key, handle) {
            previous.abort();
        }
    }

    fn stop_forwarding(&mut self, key: &RoomKey) {
        if let Some(handle) = self.forwarders.remove(key) {
            handle.abort();
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (room_tx, mut room_rx) = mpsc::unbounded_channel::<Arc<ServerFrame>>();
    let mut session = Session {
        id: next_connection_id(),
        codec: FrameCodec::new(Encoding::Json),
        forwarders: HashMap::new(),
        room_tx,
    };

    state.hub.register(&session.id);
    debug!(connection = %session.id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let greeting = ServerFrame::Connected(Connected::new(session.id.as_str(), PROTOCOL_VERSION));
    if send_frame(&mut sender, &session.codec, &greeting).await.is_err() {
        error!(connection = %session.id, "Failed to send connected frame");
        state.hub.unsubscribe_all(&session.id);
        return;
    }

    // Read buffer for length-prefixed MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(frame) = room_rx.recv() => {
                if send_frame(&mut sender, &session.codec, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_frame(text.len(), "inbound");
                        session.codec.set_encoding(Encoding::Json);

                        match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if let Err(e) = handle_frame(frame, &mut session, &state, &mut sender).await {
                                    debug!(connection = %session.id, error = %e, "Send failed");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %session.id, error = %e, "Ignoring undecodable frame");
                                metrics::record_error("decode");
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        session.codec.set_encoding(Encoding::MessagePack);
                        read_buffer.extend_from_slice(&data);

                        if let Err(e) = drain_binary(&mut read_buffer, &mut session, &state, &mut sender).await {
                            debug!(connection = %session.id, error = %e, "Send failed");
                            break;
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session.id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in session.forwarders.drain() {
        handle.abort();
    }
    state.hub.unsubscribe_all(&session.id);
    metrics::set_active_rooms(state.hub.stats().room_count);

    debug!(connection = %session.id, "WebSocket disconnected");
}

/// Handle every complete MessagePack frame in the read buffer.
async fn drain_binary(
    read_buffer: &mut BytesMut,
    session: &mut Session,
    state: &Arc<AppState>,
    sender: &mut Sender,
) -> Result<()> {
    loop {
        match session.codec.decode_from::<ClientFrame>(read_buffer) {
            Ok(Some(frame)) => handle_frame(frame, session, state, sender).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection = %session.id, error = %e, "Discarding undecodable binary data");
                metrics::record_error("decode");
                read_buffer.clear();
                return Ok(());
            }
        }
    }
}

/// Handle a decoded client frame.
async fn handle_frame(
    frame: ClientFrame,
    session: &mut Session,
    state: &Arc<AppState>,
    sender: &mut Sender,
) -> Result<()> {
    match frame {
        ClientFrame::Subscribe(request) => {
            debug!(
                connection = %session.id,
                metrics = ?request.metrics,
                dashboard = ?request.dashboard_id,
                "Subscribe request"
            );

            let Joined { ack, receivers } = state.hub.join(&session.id, &request);
            metrics::record_subscriptions(receivers.len());
            for (key, rx) in receivers {
                session.forward(key, rx);
            }
            metrics::set_active_rooms(state.hub.stats().room_count);

            send_frame(sender, &session.codec, &ServerFrame::Subscribed(ack)).await?;
        }

        ClientFrame::Unsubscribe(request) => {
            debug!(
                connection = %session.id,
                metrics = ?request.metrics,
                dashboard = ?request.dashboard_id,
                "Unsubscribe request"
            );

            let Left { ack, rooms } = state.hub.leave(&session.id, &request);
            for key in &rooms {
                session.stop_forwarding(key);
            }
            metrics::set_active_rooms(state.hub.stats().room_count);

            send_frame(sender, &session.codec, &ServerFrame::Unsubscribed(ack)).await?;
        }

        ClientFrame::Ping => {
            send_frame(sender, &session.codec, &ServerFrame::pong(Some(unix_millis()))).await?;
        }
    }

    Ok(())
}

/// Send a frame in the connection's current encoding.
async fn send_frame(sender: &mut Sender, codec: &FrameCodec, frame: &ServerFrame) -> Result<()> {
    let wire = codec.encode(frame)?;
    metrics::record_frame(wire.len(), "outbound");
    let message = match wire {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
