//! Reconnecting socket.
//!
//! A [`Socket`] is a handle to a spawned driver task that owns the actual
//! [`Connection`]. The driver connects, pumps frames in both directions,
//! and reconnects with [`ExponentialBackoff`] when the connection drops.
//! Everything that happens is reported as a [`SocketEvent`], in order, on
//! the channel returned by [`Socket::spawn`].
//!
//! ```text
//!            ┌──────── close() ────────┐
//!            ▼                         │
//! connect ─▶ Connect ─▶ session ─▶ Disconnect ─▶ delay ─▶ ReconnectAttempt(n)
//!   │                                                           │
//!   └─▶ Error (first attempt only)        Reconnect(n) ◀── ok ──┤
//!                                     ReconnectFailed ◀─ budget ┘
//! ```

use hpmon_protocol::{ClientFrame, ServerFrame};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::ExponentialBackoff;
use crate::traits::{Connection, Transport, TransportError};

/// Reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a drop or a failed first connect.
    pub enabled: bool,
    /// Attempts before giving up with [`SocketEvent::ReconnectFailed`].
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub delay_initial: Duration,
    /// Upper bound for the delay.
    pub delay_max: Duration,
    /// Random deviation applied to each delay, as a fraction of it.
    pub randomization: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            delay_initial: Duration::from_millis(1000),
            delay_max: Duration::from_millis(30_000),
            randomization: 0.5,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection.
    ServerClosed,
    /// The connection failed.
    TransportError(String),
    /// [`Socket::close`] was called or the socket was dropped.
    ClientClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed => f.write_str("server closed"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::ClientClosed => f.write_str("client closed"),
        }
    }
}

/// Lifecycle and data events reported by a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A connection is established (first time or after a reconnect).
    Connect,
    /// The current connection ended.
    Disconnect {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// About to make reconnect attempt `n` (1-based).
    ReconnectAttempt(u32),
    /// Reconnected after `n` attempts.
    Reconnect(u32),
    /// The attempt budget is exhausted; the socket has stopped.
    ReconnectFailed,
    /// The first connection attempt failed.
    Error(String),
    /// A frame from the server.
    Frame(ServerFrame),
}

/// Handle to a reconnecting connection.
///
/// Dropping the handle closes the socket.
pub struct Socket {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Socket {
    /// Start a socket driver on `runtime`.
    ///
    /// Returns immediately; the connection is opened in the background and
    /// its progress reported on the returned event channel.
    pub fn spawn(
        runtime: &Handle,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            url: url.into(),
            transport,
            policy,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            connected: Arc::clone(&connected),
            events: events_tx,
        };
        let task = runtime.spawn(driver.run());

        (
            Self {
                outbound,
                connected,
                shutdown,
                task,
            },
            events_rx,
        )
    }

    /// Queue a frame for the server.
    ///
    /// Frames queued while no connection is up are discarded when the next
    /// connection starts. Returns `false` if the driver has stopped.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Check if a connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Check if the driver task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

struct Driver {
    url: String,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    shutdown: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Driver {
    fn emit(&self, event: SocketEvent) {
        trace!(?event, "Socket event");
        let _ = self.events.send(event);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow() || self.events.is_closed()
    }

    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(
            self.policy.delay_initial,
            self.policy.delay_max,
            self.policy.randomization,
        );
        let mut reconnecting = false;

        loop {
            if self.is_shutdown() {
                break;
            }

            if reconnecting {
                if backoff.attempts() >= self.policy.max_attempts {
                    warn!(url = %self.url, attempts = backoff.attempts(), "Reconnection failed");
                    self.emit(SocketEvent::ReconnectFailed);
                    break;
                }

                let delay = backoff.next_duration();
                debug!(
                    url = %self.url,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => break,
                }
                self.emit(SocketEvent::ReconnectAttempt(backoff.attempts()));
            }

            let attempt = tokio::select! {
                result = self.transport.connect(&self.url) => result,
                _ = self.shutdown.changed() => break,
            };

            match attempt {
                Ok(mut conn) => {
                    let mut stale = 0usize;
                    while self.outbound.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        debug!(count = stale, "Discarded frames queued while disconnected");
                    }

                    self.connected.store(true, Ordering::SeqCst);
                    if reconnecting {
                        info!(url = %self.url, attempts = backoff.attempts(), "Reconnected");
                        self.emit(SocketEvent::Reconnect(backoff.attempts()));
                    } else {
                        info!(url = %self.url, connection = %conn.id(), "Connected");
                    }
                    backoff.reset();
                    reconnecting = false;
                    self.emit(SocketEvent::Connect);

                    let reason = self.session(conn.as_mut()).await;

                    self.connected.store(false, Ordering::SeqCst);
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Error while closing connection");
                    }
                    info!(url = %self.url, reason = %reason, "Disconnected");

                    let client_closed = reason == DisconnectReason::ClientClosed;
                    self.emit(SocketEvent::Disconnect { reason });
                    if client_closed || !self.policy.enabled {
                        break;
                    }
                    reconnecting = true;
                }
                Err(e) => {
                    if reconnecting {
                        warn!(url = %self.url, attempt = backoff.attempts(), error = %e, "Reconnect attempt failed");
                    } else {
                        warn!(url = %self.url, error = %e, "Connection failed");
                        self.emit(SocketEvent::Error(e.to_string()));
                    }
                    if !self.policy.enabled {
                        break;
                    }
                    reconnecting = true;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!(url = %self.url, "Socket driver stopped");
    }

    async fn session(&mut self, conn: &mut dyn Connection) -> DisconnectReason {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => return DisconnectReason::ClientClosed,

                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        trace!(event = frame.event(), "Sending frame");
                        if let Err(e) = conn.send(&frame).await {
                            warn!(error = %e, "Send failed");
                            return DisconnectReason::TransportError(e.to_string());
                        }
                    }
                    None => return DisconnectReason::ClientClosed,
                },

                received = conn.recv() => match received {
                    Ok(Some(frame)) => {
                        if self.events.send(SocketEvent::Frame(frame)).is_err() {
                            return DisconnectReason::ClientClosed;
                        }
                    }
                    Ok(None) => return DisconnectReason::ServerClosed,
                    Err(TransportError::Protocol(e)) => {
                        warn!(error = %e, "Dropping undecodable frame");
                    }
                    Err(e) => return DisconnectReason::TransportError(e.to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use serde_json::json;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            max_attempts,
            delay_initial: Duration::from_millis(100),
            delay_max: Duration::from_millis(1000),
            randomization: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_exchange_frames() {
        let (transport, mut listener) = memory::channel();
        let (socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), fast_policy(3));

        assert_eq!(events.recv().await, Some(SocketEvent::Connect));
        assert!(socket.is_connected());

        let mut peer = listener.accept().await.unwrap();
        assert!(socket.send(ClientFrame::ping()));
        assert_eq!(peer.recv().await, Some(ClientFrame::Ping));

        let update = ServerFrame::metric_sample("temp_flow", json!(35.0), None);
        peer.send(update.clone());
        assert_eq!(events.recv().await, Some(SocketEvent::Frame(update)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_server_close() {
        let (transport, mut listener) = memory::channel();
        let (socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), fast_policy(3));

        assert_eq!(events.recv().await, Some(SocketEvent::Connect));
        let mut peer = listener.accept().await.unwrap();
        peer.close();

        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Disconnect {
                reason: DisconnectReason::ServerClosed
            })
        );
        assert_eq!(events.recv().await, Some(SocketEvent::ReconnectAttempt(1)));
        assert_eq!(events.recv().await, Some(SocketEvent::Reconnect(1)));
        assert_eq!(events.recv().await, Some(SocketEvent::Connect));
        assert!(socket.is_connected());
        assert!(listener.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempt_budget() {
        let (transport, listener) = memory::channel();
        listener.set_refusing(true);

        let (socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), fast_policy(3));

        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        for n in 1..=3 {
            assert_eq!(events.recv().await, Some(SocketEvent::ReconnectAttempt(n)));
        }
        assert_eq!(events.recv().await, Some(SocketEvent::ReconnectFailed));
        assert_eq!(events.recv().await, None);
        assert!(!socket.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_without_reconnect() {
        let (transport, mut listener) = memory::channel();
        let (socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), fast_policy(3));

        assert_eq!(events.recv().await, Some(SocketEvent::Connect));
        let _peer = listener.accept().await.unwrap();

        socket.close();
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Disconnect {
                reason: DisconnectReason::ClientClosed
            })
        );
        assert_eq!(events.recv().await, None);
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_when_disabled() {
        let (transport, mut listener) = memory::channel();
        let policy = ReconnectPolicy {
            enabled: false,
            ..fast_policy(3)
        };
        let (_socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), policy);

        assert_eq!(events.recv().await, Some(SocketEvent::Connect));
        listener.accept().await.unwrap().close();

        assert!(matches!(
            events.recv().await,
            Some(SocketEvent::Disconnect { .. })
        ));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_queued_while_down_are_discarded() {
        let (transport, mut listener) = memory::channel();
        listener.set_refusing(true);
        let (socket, mut events) =
            Socket::spawn(&Handle::current(), "memory://hp", Arc::new(transport), fast_policy(3));

        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        socket.send(ClientFrame::ping());
        listener.set_refusing(false);

        assert_eq!(events.recv().await, Some(SocketEvent::ReconnectAttempt(1)));
        assert_eq!(events.recv().await, Some(SocketEvent::Reconnect(1)));
        assert_eq!(events.recv().await, Some(SocketEvent::Connect));

        let mut peer = listener.accept().await.unwrap();
        assert!(peer.try_recv().is_none());
    }
}
