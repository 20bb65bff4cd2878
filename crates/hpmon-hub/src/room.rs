//! Subscription rooms.
//!
//! A room groups the connections interested in one metric or one dashboard.
//! Frames published to a room are fanned out over a broadcast channel.

use hpmon_protocol::ServerFrame;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum metric name length in bytes.
pub const MAX_METRIC_NAME_LENGTH: usize = 256;

/// Default broadcast capacity per room.
const DEFAULT_ROOM_CAPACITY: usize = 1024;

/// Prefix of dashboard room names.
const DASHBOARD_PREFIX: &str = "dashboard_";

/// Validate a metric name.
///
/// # Errors
///
/// Returns a description of the problem if the name is unusable.
pub fn validate_metric_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Metric name cannot be empty");
    }
    if name.len() > MAX_METRIC_NAME_LENGTH {
        return Err("Metric name too long");
    }
    if name.starts_with('$') {
        return Err("Metric names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Metric name contains invalid characters");
    }
    Ok(())
}

/// Identifies a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RoomKey {
    /// Everyone subscribed to one metric.
    Metric(String),
    /// Everyone watching one dashboard.
    Dashboard(String),
}

impl RoomKey {
    /// Room for a metric.
    #[must_use]
    pub fn metric(name: impl Into<String>) -> Self {
        RoomKey::Metric(name.into())
    }

    /// Room for a dashboard.
    #[must_use]
    pub fn dashboard(id: impl Into<String>) -> Self {
        RoomKey::Dashboard(id.into())
    }

    /// The bare metric name or dashboard id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            RoomKey::Metric(name) | RoomKey::Dashboard(name) => name,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Metric(name) => f.write_str(name),
            RoomKey::Dashboard(id) => write!(f, "{}{}", DASHBOARD_PREFIX, id),
        }
    }
}

/// A set of member connections sharing a broadcast channel.
#[derive(Debug)]
pub struct Room {
    key: RoomKey,
    sender: broadcast::Sender<Arc<ServerFrame>>,
    members: HashSet<String>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(key: RoomKey) -> Self {
        Self::with_capacity(key, DEFAULT_ROOM_CAPACITY)
    }

    /// Create an empty room with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(key: RoomKey, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            key,
            sender,
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Number of member connections.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a connection.
    ///
    /// Returns a receiver for the room's frames, or `None` if the connection
    /// was already a member.
    pub fn join(&mut self, connection_id: &str) -> Option<broadcast::Receiver<Arc<ServerFrame>>> {
        if !self.members.insert(connection_id.to_string()) {
            return None;
        }
        debug!(room = %self.key, connection = %connection_id, "Joined room");
        Some(self.sender.subscribe())
    }

    /// Remove a connection. Returns `true` if it was a member.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(room = %self.key, connection = %connection_id, "Left room");
        }
        removed
    }

    /// Publish a frame to every member.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, frame: Arc<ServerFrame>) -> usize {
        trace!(room = %self.key, event = frame.event(), "Publishing frame");
        self.sender.send(frame).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_key_display() {
        assert_eq!(RoomKey::metric("temp_flow").to_string(), "temp_flow");
        assert_eq!(RoomKey::dashboard("main").to_string(), "dashboard_main");
        assert_eq!(RoomKey::dashboard("main").id(), "main");
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut room = Room::new(RoomKey::metric("temp_flow"));

        assert!(room.join("conn-1").is_some());
        assert!(room.join("conn-1").is_none());
        assert_eq!(room.member_count(), 1);

        assert!(room.leave("conn-1"));
        assert!(!room.leave("conn-1"));
        assert!(room.is_empty());
    }

    #[test]
    fn test_metric_name_validation() {
        assert!(validate_metric_name("temp_outside").is_ok());
        assert!(validate_metric_name("").is_err());
        assert!(validate_metric_name("$internal").is_err());
        assert!(validate_metric_name("temp\nflow").is_err());
        assert!(validate_metric_name("température").is_err());

        let long_name = "t".repeat(MAX_METRIC_NAME_LENGTH + 1);
        assert!(validate_metric_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_members() {
        let mut room = Room::new(RoomKey::metric("temp_flow"));
        let mut rx = room.join("conn-1").unwrap();

        let frame = Arc::new(ServerFrame::pong(Some(1)));
        assert_eq!(room.publish(Arc::clone(&frame)), 1);
        assert_eq!(rx.recv().await.unwrap(), frame);
    }
}
