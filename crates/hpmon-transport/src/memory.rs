//! In-process transport.
//!
//! [`MemoryTransport`] connects to a [`MemoryListener`] living in the same
//! process. Every successful `connect` hands the listener a [`MemoryPeer`]
//! playing the server side of the connection. Useful for embedding a client
//! and server in one binary, and for exercising reconnect behavior in tests
//! without sockets.

use async_trait::async_trait;
use hpmon_protocol::{ClientFrame, ServerFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connection, ConnectionId, Transport, TransportError, TransportKind};

/// Create a connected transport/listener pair.
#[must_use]
pub fn channel() -> (MemoryTransport, MemoryListener) {
    let (acceptor, incoming) = mpsc::unbounded_channel();
    let refusing = Arc::new(AtomicBool::new(false));
    (
        MemoryTransport {
            acceptor,
            refusing: Arc::clone(&refusing),
            kind: TransportKind::WebSocket,
        },
        MemoryListener { incoming, refusing },
    )
}

/// Client side of the in-process transport.
#[derive(Clone)]
pub struct MemoryTransport {
    acceptor: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    kind: TransportKind,
}

impl MemoryTransport {
    /// Report a different transport kind (to stand in for e.g. polling).
    #[must_use]
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(url.to_string()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            inbound: from_client,
            outbound: Some(to_client),
        };
        self.acceptor
            .send(peer)
            .map_err(|_| TransportError::Refused(url.to_string()))?;

        let conn = MemoryConnection {
            id: ConnectionId::generate(),
            inbound: from_server,
            outbound: to_server,
            open: true,
        };
        debug!(connection = %conn.id, url = %url, "Memory connection opened");
        Ok(Box::new(conn))
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Server side: receives a [`MemoryPeer`] per accepted connection.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

impl MemoryListener {
    /// Wait for the next connection.
    ///
    /// Returns `None` once every [`MemoryTransport`] has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take an already-opened connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

/// The server end of one in-process connection.
pub struct MemoryPeer {
    url: String,
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    outbound: Option<mpsc::UnboundedSender<ServerFrame>>,
}

impl MemoryPeer {
    /// The URL the client connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a frame to the client.
    ///
    /// Returns `false` if the client side is gone or the peer was closed.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Wait for the next frame from the client.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.inbound.recv().await
    }

    /// Take a frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.inbound.try_recv().ok()
    }

    /// Close the server side; the client observes a clean close.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

/// Client end of one in-process connection.
struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        match self.inbound.recv().await {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(frame.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.inbound.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut listener) = channel();

        let mut conn = transport.connect("memory://test").await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.url(), "memory://test");

        conn.send(&ClientFrame::ping()).await.unwrap();
        assert_eq!(peer.recv().await, Some(ClientFrame::Ping));

        assert!(peer.send(ServerFrame::metric_sample("temp_flow", json!(35.0), None)));
        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(frame.event(), "metric_update");
    }

    #[tokio::test]
    async fn test_peer_close_is_clean_eof() {
        let (transport, mut listener) = channel();
        let mut conn = transport.connect("memory://test").await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        peer.close();
        assert!(conn.recv().await.unwrap().is_none());
        assert!(!conn.is_open());
        assert!(!peer.send(ServerFrame::pong(None)));
    }

    #[tokio::test]
    async fn test_refusing_listener() {
        let (transport, listener) = channel();
        listener.set_refusing(true);
        assert!(matches!(
            transport.connect("memory://test").await,
            Err(TransportError::Refused(_))
        ));

        listener.set_refusing(false);
        assert!(transport.connect("memory://test").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_listener_refuses() {
        let (transport, listener) = channel();
        drop(listener);
        assert!(transport.connect("memory://test").await.is_err());
    }
}
