//! Subscription hub.
//!
//! The hub tracks which connection sits in which room and publishes metric
//! and dashboard frames to the rooms that want them.

use crate::room::{validate_metric_name, Room, RoomKey};
use dashmap::{DashMap, DashSet};
use hpmon_protocol::{ServerFrame, Subscription};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Receiver for the frames of one room.
pub type RoomReceiver = broadcast::Receiver<Arc<ServerFrame>>;

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// Invalid metric name or dashboard id.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        name: String,
        reason: &'static str,
    },

    /// Maximum subscriptions per connection reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_subscriptions_per_connection: usize,
    /// Broadcast capacity per room.
    pub room_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_subscriptions_per_connection: 256,
            room_capacity: 1024,
        }
    }
}

/// Result of a subscribe request.
#[derive(Debug)]
pub struct Joined {
    /// Acknowledgement payload: the accepted metrics and dashboard.
    pub ack: Subscription,
    /// Receivers for rooms the connection newly joined.
    pub receivers: Vec<(RoomKey, RoomReceiver)>,
}

/// Result of an unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Left {
    /// Acknowledgement payload, echoing the request.
    pub ack: Subscription,
    /// Rooms the connection actually left.
    pub rooms: Vec<RoomKey>,
}

/// The subscription hub.
pub struct Hub {
    /// Rooms indexed by key.
    rooms: DashMap<RoomKey, Room>,
    /// Connection id -> rooms it belongs to.
    connections: DashMap<String, DashSet<RoomKey>>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!(?config, "Creating subscription hub");
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Register a newly connected client.
    pub fn register(&self, connection_id: &str) {
        self.connections.entry(connection_id.to_string()).or_default();
        debug!(connection = %connection_id, "Connection registered");
    }

    /// Join a single room.
    ///
    /// Returns `Ok(None)` if the connection is already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or a limit is reached.
    pub fn subscribe(&self, connection_id: &str, key: RoomKey) -> Result<Option<RoomReceiver>, HubError> {
        validate_metric_name(key.id()).map_err(|reason| HubError::InvalidName {
            name: key.id().to_string(),
            reason,
        })?;

        let memberships = self.connections.entry(connection_id.to_string()).or_default();
        if memberships.contains(&key) {
            return Ok(None);
        }
        if memberships.len() >= self.config.max_subscriptions_per_connection {
            return Err(HubError::MaxSubscriptionsReached);
        }
        if !self.rooms.contains_key(&key) && self.rooms.len() >= self.config.max_rooms {
            return Err(HubError::MaxRoomsReached);
        }

        let mut room = self.rooms.entry(key.clone()).or_insert_with(|| {
            debug!(room = %key, "Creating room");
            Room::with_capacity(key.clone(), self.config.room_capacity)
        });
        let receiver = room.join(connection_id);
        memberships.insert(key);
        Ok(receiver)
    }

    /// Leave a single room. Leaving a room the connection is not in is a no-op.
    ///
    /// Returns `true` if the connection was a member.
    pub fn unsubscribe(&self, connection_id: &str, key: &RoomKey) -> bool {
        let was_member = self
            .connections
            .get(connection_id)
            .is_some_and(|m| m.remove(key).is_some());
        if !was_member {
            return false;
        }

        if let Some(mut room) = self.rooms.get_mut(key) {
            room.leave(connection_id);
        }
        self.remove_if_empty(key);
        true
    }

    /// Handle a `subscribe` request.
    ///
    /// Names that fail validation or exceed limits are logged and left out
    /// of the acknowledgement.
    pub fn join(&self, connection_id: &str, request: &Subscription) -> Joined {
        let mut ack = Subscription::default();
        let mut receivers = Vec::new();

        for metric in &request.metrics {
            match self.subscribe(connection_id, RoomKey::metric(metric.as_str())) {
                Ok(receiver) => {
                    if !ack.metrics.contains(metric) {
                        ack.metrics.push(metric.clone());
                    }
                    if let Some(rx) = receiver {
                        receivers.push((RoomKey::metric(metric.as_str()), rx));
                    }
                }
                Err(e) => warn!(connection = %connection_id, error = %e, "Rejected metric subscription"),
            }
        }

        if let Some(id) = request.dashboard_id.as_deref() {
            match self.subscribe(connection_id, RoomKey::dashboard(id)) {
                Ok(receiver) => {
                    ack.dashboard_id = Some(id.to_string());
                    if let Some(rx) = receiver {
                        receivers.push((RoomKey::dashboard(id), rx));
                    }
                }
                Err(e) => warn!(connection = %connection_id, error = %e, "Rejected dashboard subscription"),
            }
        }

        debug!(
            connection = %connection_id,
            metrics = ?ack.metrics,
            dashboard = ?ack.dashboard_id,
            "Subscribed"
        );
        Joined { ack, receivers }
    }

    /// Handle an `unsubscribe` request.
    pub fn leave(&self, connection_id: &str, request: &Subscription) -> Left {
        let keys = request
            .metrics
            .iter()
            .map(|m| RoomKey::metric(m.as_str()))
            .chain(request.dashboard_id.as_deref().map(RoomKey::dashboard));

        let rooms = keys
            .filter(|key| self.unsubscribe(connection_id, key))
            .collect();

        Left {
            ack: request.clone(),
            rooms,
        }
    }

    /// Drop a connection from every room.
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, memberships)) = self.connections.remove(connection_id) {
            for key in memberships.iter() {
                if let Some(mut room) = self.rooms.get_mut(key.key()) {
                    room.leave(connection_id);
                }
                self.remove_if_empty(key.key());
            }
        }
        debug!(connection = %connection_id, "Removed from all rooms");
    }

    fn remove_if_empty(&self, key: &RoomKey) {
        if self.rooms.remove_if(key, |_, room| room.is_empty()).is_some() {
            debug!(room = %key, "Deleted empty room");
        }
    }

    /// Publish a frame to one room.
    ///
    /// Returns the number of receivers reached; zero if nobody is subscribed.
    pub fn publish(&self, key: &RoomKey, frame: ServerFrame) -> usize {
        match self.rooms.get(key) {
            Some(room) if !room.is_empty() => room.publish(Arc::new(frame)),
            _ => {
                trace!(room = %key, "No subscribers, dropping frame");
                0
            }
        }
    }

    /// Push one metric reading to its subscribers.
    pub fn broadcast_metric(&self, metric: &str, value: Value, timestamp: Option<i64>) -> usize {
        self.publish(
            &RoomKey::metric(metric),
            ServerFrame::metric_sample(metric, value, timestamp),
        )
    }

    /// Push a map of readings, stamped with the current time in seconds.
    ///
    /// Each metric with subscribers receives its own sample frame. Returns
    /// the number of metrics that had subscribers.
    pub fn broadcast_metrics(&self, values: &Map<String, Value>) -> usize {
        self.broadcast_metrics_at(values, unix_seconds())
    }

    /// Push a map of readings with an explicit timestamp.
    pub fn broadcast_metrics_at(&self, values: &Map<String, Value>, timestamp: i64) -> usize {
        let delivered = values
            .iter()
            .filter(|(metric, value)| {
                self.broadcast_metric(metric, (*value).clone(), Some(timestamp)) > 0
            })
            .count();
        trace!(total = values.len(), delivered, "Broadcast metrics");
        delivered
    }

    /// Push an opaque update to everyone watching a dashboard.
    pub fn broadcast_dashboard(&self, dashboard_id: &str, data: Value) -> usize {
        self.publish(
            &RoomKey::dashboard(dashboard_id),
            ServerFrame::DashboardUpdate(data),
        )
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, key: &RoomKey) -> usize {
        self.rooms.get(key).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Rooms a connection belongs to.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self
            .connections
            .get(connection_id)
            .map(|m| m.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Snapshot of hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            total_connections: self.connections.len(),
            room_count: self.rooms.len(),
            ..HubStats::default()
        };
        for room in self.rooms.iter() {
            let count = room.member_count();
            match room.key() {
                RoomKey::Metric(name) => {
                    stats.metric_subscriptions.insert(name.clone(), count);
                }
                RoomKey::Dashboard(id) => {
                    stats.dashboard_subscriptions.insert(id.clone(), count);
                }
            }
        }
        stats
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics, as served on `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered connections.
    pub total_connections: usize,
    /// Live rooms.
    pub room_count: usize,
    /// Metric name -> subscriber count.
    pub metric_subscriptions: BTreeMap<String, usize>,
    /// Dashboard id -> subscriber count.
    pub dashboard_subscriptions: BTreeMap<String, usize>,
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
