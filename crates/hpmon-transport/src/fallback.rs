//! Transport preference and fallback.
//!
//! A client lists the transports it is willing to use, most preferred first
//! (by default `[websocket, polling]`). [`FallbackTransport`] resolves that
//! list against the transports actually registered and tries them in order
//! on every connection attempt.

use crate::traits::{Connection, Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Order the available kinds by preference, dropping kinds nobody provides.
#[must_use]
pub fn negotiate(preference: &[TransportKind], available: &[TransportKind]) -> Vec<TransportKind> {
    let mut chosen = Vec::new();
    for kind in preference {
        if available.contains(kind) && !chosen.contains(kind) {
            chosen.push(*kind);
        }
    }
    chosen
}

/// A transport that tries multiple transports in order of preference.
#[derive(Clone, Default)]
pub struct FallbackTransport {
    transports: Vec<Arc<dyn Transport>>,
}

impl FallbackTransport {
    /// Create a new fallback transport.
    ///
    /// Transports are tried in order (first = highest priority).
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// Build the chain for a preference list out of the registered transports.
    ///
    /// Preferred kinds with no registered transport are skipped.
    #[must_use]
    pub fn with_preference(registered: &[Arc<dyn Transport>], preference: &[TransportKind]) -> Self {
        let available: Vec<TransportKind> = registered.iter().map(|t| t.kind()).collect();
        let order = negotiate(preference, &available);

        for kind in preference {
            if !order.contains(kind) {
                debug!(transport = %kind, "No transport registered, skipping");
            }
        }

        let transports = order
            .iter()
            .filter_map(|kind| registered.iter().find(|t| t.kind() == *kind).cloned())
            .collect();
        Self { transports }
    }

    /// Register a transport at the lowest priority.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Get the transport kinds in priority order.
    #[must_use]
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }

    /// Check if no transport is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let mut last_error = None;

        for transport in &self.transports {
            if !transport.is_healthy() {
                continue;
            }
            match transport.connect(url).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(transport = %transport.kind(), error = %e, "Transport failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::NoTransport))
    }

    fn kind(&self) -> TransportKind {
        self.transports
            .first()
            .map(|t| t.kind())
            .unwrap_or_default()
    }

    fn is_healthy(&self) -> bool {
        self.transports.iter().any(|t| t.is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;

    #[test]
    fn test_negotiate_order() {
        use TransportKind::*;

        assert_eq!(negotiate(&[WebSocket, Polling], &[Polling, WebSocket]), vec![WebSocket, Polling]);
        assert_eq!(negotiate(&[WebSocket, Polling], &[WebSocket]), vec![WebSocket]);
        assert_eq!(negotiate(&[Polling], &[WebSocket]), Vec::<TransportKind>::new());
    }

    #[test]
    fn test_preference_skips_unregistered() {
        let (ws, _listener) = memory::channel();
        let registered: Vec<Arc<dyn Transport>> = vec![Arc::new(ws)];

        let chain = FallbackTransport::with_preference(
            &registered,
            &[TransportKind::WebSocket, TransportKind::Polling],
        );
        assert_eq!(chain.kinds(), vec![TransportKind::WebSocket]);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_transport() {
        let (primary, primary_listener) = memory::channel();
        let (polling, mut polling_listener) = memory::channel();
        primary_listener.set_refusing(true);

        let chain = FallbackTransport::new(vec![
            Arc::new(primary),
            Arc::new(polling.with_kind(TransportKind::Polling)),
        ]);

        let conn = chain.connect("memory://test").await;
        assert!(conn.is_ok());
        assert!(polling_listener.try_accept().is_some());
    }

    #[tokio::test]
    async fn test_empty_chain_has_no_transport() {
        let chain = FallbackTransport::default();
        assert!(chain.is_empty());
        assert!(matches!(
            chain.connect("memory://test").await,
            Err(TransportError::NoTransport)
        ));
    }
}
