//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Text messages carry JSON frames, binary messages carry length-prefixed
//! MessagePack frames.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use hpmon_protocol::{codec, ClientFrame, Encoding, FrameCodec, ServerFrame, WireMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Connection, ConnectionId, Transport, TransportError, TransportKind};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Encoding for outbound frames.
    pub encoding: Encoding,
    /// Time allowed for the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            encoding: Encoding::Json,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Get the transport configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| match e {
                WsError::Io(io) => TransportError::Io(io),
                other => TransportError::Other(format!("WebSocket handshake failed: {}", other)),
            })?;

        debug!(url = %url, "WebSocket handshake completed");

        Ok(Box::new(WebSocketConnection::new(stream, &self.config)))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

/// A WebSocket client connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: FrameCodec,
    is_open: bool,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, config: &WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            codec: FrameCodec::new(config.encoding),
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(
                hpmon_protocol::ProtocolError::FrameTooLarge(len),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        loop {
            // A binary message may have carried more than one frame
            if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!(connection = %self.id, "Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.codec.encode(frame)? {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
