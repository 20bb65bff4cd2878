//! Transport abstraction traits for hpmon.
//!
//! These traits define what the reconnecting [`Socket`](crate::Socket) needs
//! from an underlying channel, so it can drive WebSocket, in-memory or
//! embedder-provided transports the same way.

use async_trait::async_trait;
use hpmon_protocol::{ClientFrame, ServerFrame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kinds of transport, in the vocabulary used by transport preference lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Full-duplex WebSocket channel.
    #[default]
    WebSocket,
    /// Request/response polling channel.
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Polling => f.write_str("polling"),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection attempt timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The remote end refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// No transport in the preference list is available.
    #[error("No transport available")]
    NoTransport,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] hpmon_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can open connections to a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport kind.
    fn kind(&self) -> TransportKind;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An open client connection.
///
/// `recv` must be cancel safe: the socket driver polls it inside `select!`
/// alongside outbound traffic.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next frame from the server.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;

    /// Send a frame to the server.
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_transport_kind_names() {
        let kinds: Vec<TransportKind> =
            serde_json::from_str(r#"["websocket", "polling"]"#).unwrap();
        assert_eq!(kinds, vec![TransportKind::WebSocket, TransportKind::Polling]);
        assert_eq!(TransportKind::Polling.to_string(), "polling");
    }
}
