//! Listener registry.
//!
//! Collaborators register callbacks per [`EventKind`]. Callbacks run in
//! registration order, outside any client lock, and each one is isolated:
//! an `Err` return or a panic is logged and the next callback still runs.

use hpmon_protocol::{Pong, Subscription};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, trace};

use crate::state::ConnectionState;

/// Events delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    MetricUpdate,
    DashboardUpdate,
    Subscribed,
    Unsubscribed,
    Pong,
}

impl EventKind {
    /// Event name as used on the wire and in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "state_change",
            EventKind::MetricUpdate => "metric_update",
            EventKind::DashboardUpdate => "dashboard_update",
            EventKind::Subscribed => "subscribed",
            EventKind::Unsubscribed => "unsubscribed",
            EventKind::Pong => "pong",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChange(ConnectionState),
    /// A batch of metric updates collected over one debounce window.
    MetricUpdate(Map<String, Value>),
    /// Opaque dashboard change.
    DashboardUpdate(Value),
    /// The server acknowledged a subscribe.
    Subscribed(Subscription),
    /// The server acknowledged an unsubscribe.
    Unsubscribed(Subscription),
    /// The server answered a ping.
    Pong(Pong),
}

impl ClientEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::StateChange(_) => EventKind::StateChange,
            ClientEvent::MetricUpdate(_) => EventKind::MetricUpdate,
            ClientEvent::DashboardUpdate(_) => EventKind::DashboardUpdate,
            ClientEvent::Subscribed(_) => EventKind::Subscribed,
            ClientEvent::Unsubscribed(_) => EventKind::Unsubscribed,
            ClientEvent::Pong(_) => EventKind::Pong,
        }
    }
}

/// Error returned by a listener.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Identifies one registration, for removal with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A registered callback.
pub type Listener = Arc<dyn Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Callbacks grouped by event kind, in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(ListenerId, Listener)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback; registering the same closure twice yields two
    /// independent registrations.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        trace!(event = %kind, listener = id.0, "Listener registered");
        id
    }

    /// Remove exactly one registration. Returns `false` if it was not found.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of callbacks registered for a kind.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every callback registered for its kind.
    ///
    /// Returns the number of callbacks that completed successfully.
    pub fn emit(&self, event: &ClientEvent) -> usize {
        let kind = event.kind();
        // Snapshot so callbacks may register/unregister or call back into the client.
        let snapshot: Vec<(ListenerId, Listener)> =
            self.lock().get(&kind).cloned().unwrap_or_default();

        let mut ok = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    error!(event = %kind, listener = id.0, error = %e, "Listener failed");
                }
                Err(panic) => {
                    error!(
                        event = %kind,
                        listener = id.0,
                        panic = panic_message(panic.as_ref()),
                        "Listener panicked"
                    );
                }
            }
        }
        ok
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(registry: &ListenerRegistry, kind: EventKind) -> (ListenerId, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let id = registry.on(kind, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (id, hits)
    }

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let registry = ListenerRegistry::new();
        let (_, state_hits) = counter(&registry, EventKind::StateChange);
        let (_, pong_hits) = counter(&registry, EventKind::Pong);

        registry.emit(&ClientEvent::StateChange(ConnectionState::Connecting));

        assert_eq!(state_hits.load(Ordering::SeqCst), 1);
        assert_eq!(pong_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_removes_exact_registration() {
        let registry = ListenerRegistry::new();
        let (first, first_hits) = counter(&registry, EventKind::Pong);
        let (_, second_hits) = counter(&registry, EventKind::Pong);

        assert!(registry.off(EventKind::Pong, first));
        assert!(!registry.off(EventKind::Pong, first));
        assert!(!registry.off(EventKind::StateChange, first));

        registry.emit(&ClientEvent::Pong(Pong::default()));
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(EventKind::Pong), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_the_next() {
        let registry = ListenerRegistry::new();
        registry.on(EventKind::MetricUpdate, |_| Err("bad payload".into()));
        registry.on(EventKind::MetricUpdate, |_| panic!("listener bug"));
        let (_, hits) = counter(&registry, EventKind::MetricUpdate);

        let delivered = registry.emit(&ClientEvent::MetricUpdate(Map::new()));

        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let reg = Arc::clone(&registry);
        let own = Arc::clone(&slot);
        let id = registry.on(EventKind::Pong, move |_| {
            if let Some(id) = *own.lock().unwrap() {
                reg.off(EventKind::Pong, id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(registry.emit(&ClientEvent::Pong(Pong::default())), 1);
        assert_eq!(registry.count(EventKind::Pong), 0);
    }

    #[test]
    fn test_clear() {
        let registry = ListenerRegistry::new();
        counter(&registry, EventKind::Pong);
        counter(&registry, EventKind::StateChange);

        registry.clear();
        assert_eq!(registry.count(EventKind::Pong), 0);
        assert_eq!(registry.emit(&ClientEvent::Pong(Pong::default())), 0);
    }
}
