//! # hpmon-transport
//!
//! Client-side transport layer for hpmon realtime updates.
//!
//! This crate owns everything between the wire and the realtime client:
//!
//! - **Transports** - [`WebSocketTransport`] and the in-process [`memory`] transport
//! - **Fallback** - ordered transport preference ([`FallbackTransport`])
//! - **Backoff** - exponential reconnect delays with jitter ([`ExponentialBackoff`])
//! - **Socket** - a driver task that connects, reconnects and reports
//!   lifecycle events ([`Socket`], [`SocketEvent`])
//!
//! ```rust,ignore
//! use hpmon_transport::{ReconnectPolicy, Socket, SocketEvent, WebSocketTransport};
//!
//! let transport = Arc::new(WebSocketTransport::default());
//! let (socket, mut events) = Socket::spawn(&handle, "ws://127.0.0.1:8080/ws", transport, ReconnectPolicy::default());
//! while let Some(event) = events.recv().await {
//!     // React to Connect / Disconnect / Frame(..)
//! }
//! ```

pub mod backoff;
pub mod fallback;
pub mod memory;
pub mod socket;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::ExponentialBackoff;
pub use fallback::FallbackTransport;
pub use socket::{DisconnectReason, ReconnectPolicy, Socket, SocketEvent};
pub use traits::{Connection, ConnectionId, Transport, TransportError, TransportKind};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
