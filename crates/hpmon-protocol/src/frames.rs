//! Frame types for the hpmon protocol.
//!
//! Frames are named events. On the wire every frame is an [`Envelope`]
//! (`{"event": ..., "data": ...}`); the typed [`ClientFrame`] and
//! [`ServerFrame`] enums convert to and from it through serde.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::ProtocolError;
use crate::version::Version;

/// Event names used on the wire.
pub mod events {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const CONNECTED: &str = "connected";
    pub const METRIC_UPDATE: &str = "metric_update";
    pub const DASHBOARD_UPDATE: &str = "dashboard_update";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const PONG: &str = "pong";
}

/// The untyped wire representation of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Optional event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Deserialize a struct payload; a missing payload is treated as `{}`.
fn payload<T: DeserializeOwned>(event: &str, data: Option<Value>) -> Result<T, ProtocolError> {
    let value = data.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(format!("{event}: {e}")))
}

/// A set of metrics plus an optional dashboard correlation tag.
///
/// Used both for `subscribe`/`unsubscribe` requests and for the server's
/// `subscribed`/`unsubscribed` acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Metric names.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Dashboard id, serialized as `null` when absent.
    #[serde(default)]
    pub dashboard_id: Option<String>,
}

impl Subscription {
    /// Create a new subscription payload.
    #[must_use]
    pub fn new<I, S>(metrics: I, dashboard_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            dashboard_id: dashboard_id.map(str::to_string),
        }
    }

    /// Convert to a JSON payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "metrics": self.metrics,
            "dashboard_id": self.dashboard_id,
        })
    }
}

/// Builder for a single named metric reading.
///
/// Received samples are kept as raw objects in [`MetricUpdate::Sample`];
/// this type only shapes the ones the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name.
    pub metric: String,
    /// Current value.
    pub value: Value,
    /// Unix timestamp of the reading, if the source provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl MetricSample {
    /// Create a new sample.
    #[must_use]
    pub fn new(metric: impl Into<String>, value: Value, timestamp: Option<i64>) -> Self {
        Self {
            metric: metric.into(),
            value,
            timestamp,
        }
    }

    /// Convert to a JSON object.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("metric".into(), Value::String(self.metric.clone()));
        map.insert("value".into(), self.value.clone());
        if let Some(ts) = self.timestamp {
            map.insert("timestamp".into(), Value::from(ts));
        }
        map
    }
}

/// Payload of a `metric_update` event.
///
/// An object with a string `metric` field names a single metric and is
/// kept exactly as received; any other object is a map of metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub enum MetricUpdate {
    /// `{"metric": ..., "value": ..., ...}`
    Sample {
        /// The `metric` field.
        metric: String,
        /// The whole object, `metric` included.
        sample: Map<String, Value>,
    },
    /// `{"metric_a": value, "metric_b": value}`
    Batch(Map<String, Value>),
}

impl MetricUpdate {
    /// Convert to a JSON payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            MetricUpdate::Sample { sample, .. } => Value::Object(sample.clone()),
            MetricUpdate::Batch(map) => Value::Object(map.clone()),
        }
    }

    /// Key/value pairs to merge into a pending batch.
    ///
    /// A sample is keyed by its metric name and keeps the whole sample
    /// object as the value; a map contributes each of its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<(String, Value)> {
        match self {
            MetricUpdate::Sample { metric, sample } => vec![(metric, Value::Object(sample))],
            MetricUpdate::Batch(map) => map.into_iter().collect(),
        }
    }
}

impl From<Map<String, Value>> for MetricUpdate {
    fn from(map: Map<String, Value>) -> Self {
        match map.get("metric").and_then(Value::as_str) {
            Some(metric) => MetricUpdate::Sample {
                metric: metric.to_string(),
                sample: map,
            },
            None => MetricUpdate::Batch(map),
        }
    }
}

impl From<MetricUpdate> for Map<String, Value> {
    fn from(update: MetricUpdate) -> Self {
        match update {
            MetricUpdate::Sample { sample, .. } => sample,
            MetricUpdate::Batch(map) => map,
        }
    }
}

impl From<MetricSample> for MetricUpdate {
    fn from(sample: MetricSample) -> Self {
        MetricUpdate::Sample {
            sample: sample.to_map(),
            metric: sample.metric,
        }
    }
}

/// Server greeting sent right after the transport connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    /// Always `"connected"`.
    #[serde(default)]
    pub status: String,
    /// Server-assigned session id.
    #[serde(default)]
    pub sid: Option<String>,
    /// Protocol version spoken by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl Connected {
    /// Create a greeting for the given session id.
    #[must_use]
    pub fn new(sid: impl Into<String>, version: Version) -> Self {
        Self {
            status: "connected".to_string(),
            sid: Some(sid.into()),
            version: Some(version),
        }
    }
}

/// Reply to a `ping`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Server time in milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum ClientFrame {
    /// Subscribe to metrics and optionally a dashboard.
    Subscribe(Subscription),
    /// Unsubscribe from metrics and optionally a dashboard.
    Unsubscribe(Subscription),
    /// Liveness check.
    Ping,
}

impl ClientFrame {
    /// Get the wire event name.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            ClientFrame::Subscribe(_) => events::SUBSCRIBE,
            ClientFrame::Unsubscribe(_) => events::UNSUBSCRIBE,
            ClientFrame::Ping => events::PING,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe<I, S>(metrics: I, dashboard_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientFrame::Subscribe(Subscription::new(metrics, dashboard_id))
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe<I, S>(metrics: I, dashboard_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientFrame::Unsubscribe(Subscription::new(metrics, dashboard_id))
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        ClientFrame::Ping
    }
}

impl From<ClientFrame> for Envelope {
    fn from(frame: ClientFrame) -> Envelope {
        let event = frame.event();
        match frame {
            ClientFrame::Subscribe(sub) | ClientFrame::Unsubscribe(sub) => {
                Envelope::new(event, Some(sub.to_value()))
            }
            ClientFrame::Ping => Envelope::new(event, None),
        }
    }
}

impl TryFrom<Envelope> for ClientFrame {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope { event, data } = envelope;
        match event.as_str() {
            events::SUBSCRIBE => Ok(ClientFrame::Subscribe(payload(&event, data)?)),
            events::UNSUBSCRIBE => Ok(ClientFrame::Unsubscribe(payload(&event, data)?)),
            events::PING => Ok(ClientFrame::Ping),
            _ => Err(ProtocolError::UnknownEvent(event)),
        }
    }
}

/// A frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum ServerFrame {
    /// Connection greeting.
    Connected(Connected),
    /// One or more metric values changed.
    MetricUpdate(MetricUpdate),
    /// Opaque dashboard change notification.
    DashboardUpdate(Value),
    /// Subscribe acknowledgement.
    Subscribed(Subscription),
    /// Unsubscribe acknowledgement.
    Unsubscribed(Subscription),
    /// Reply to a ping.
    Pong(Pong),
    /// An event this protocol version does not know about.
    Other {
        /// Event name.
        event: String,
        /// Raw payload.
        data: Option<Value>,
    },
}

impl ServerFrame {
    /// Get the wire event name.
    #[must_use]
    pub fn event(&self) -> &str {
        match self {
            ServerFrame::Connected(_) => events::CONNECTED,
            ServerFrame::MetricUpdate(_) => events::METRIC_UPDATE,
            ServerFrame::DashboardUpdate(_) => events::DASHBOARD_UPDATE,
            ServerFrame::Subscribed(_) => events::SUBSCRIBED,
            ServerFrame::Unsubscribed(_) => events::UNSUBSCRIBED,
            ServerFrame::Pong(_) => events::PONG,
            ServerFrame::Other { event, .. } => event,
        }
    }

    /// Create a single-metric update frame.
    #[must_use]
    pub fn metric_sample(metric: impl Into<String>, value: Value, timestamp: Option<i64>) -> Self {
        ServerFrame::MetricUpdate(MetricSample::new(metric, value, timestamp).into())
    }

    /// Create a multi-metric update frame.
    #[must_use]
    pub fn metric_batch(values: Map<String, Value>) -> Self {
        ServerFrame::MetricUpdate(MetricUpdate::Batch(values))
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<i64>) -> Self {
        ServerFrame::Pong(Pong { timestamp })
    }
}

impl From<ServerFrame> for Envelope {
    fn from(frame: ServerFrame) -> Envelope {
        match frame {
            ServerFrame::Connected(connected) => {
                let mut map = Map::new();
                map.insert("status".into(), Value::String(connected.status));
                map.insert(
                    "sid".into(),
                    connected.sid.map(Value::String).unwrap_or(Value::Null),
                );
                if let Some(version) = connected.version {
                    map.insert("version".into(), version.to_value());
                }
                Envelope::new(events::CONNECTED, Some(Value::Object(map)))
            }
            ServerFrame::MetricUpdate(update) => {
                Envelope::new(events::METRIC_UPDATE, Some(update.to_value()))
            }
            ServerFrame::DashboardUpdate(data) => Envelope::new(events::DASHBOARD_UPDATE, Some(data)),
            ServerFrame::Subscribed(sub) => Envelope::new(events::SUBSCRIBED, Some(sub.to_value())),
            ServerFrame::Unsubscribed(sub) => {
                Envelope::new(events::UNSUBSCRIBED, Some(sub.to_value()))
            }
            ServerFrame::Pong(pong) => Envelope::new(
                events::PONG,
                Some(json!({ "timestamp": pong.timestamp })),
            ),
            ServerFrame::Other { event, data } => Envelope::new(event, data),
        }
    }
}

impl TryFrom<Envelope> for ServerFrame {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope { event, data } = envelope;
        let frame = match event.as_str() {
            events::CONNECTED => ServerFrame::Connected(payload(&event, data)?),
            events::METRIC_UPDATE => ServerFrame::MetricUpdate(payload(&event, data)?),
            events::DASHBOARD_UPDATE => ServerFrame::DashboardUpdate(data.unwrap_or(Value::Null)),
            events::SUBSCRIBED => ServerFrame::Subscribed(payload(&event, data)?),
            events::UNSUBSCRIBED => ServerFrame::Unsubscribed(payload(&event, data)?),
            events::PONG => ServerFrame::Pong(payload(&event, data)?),
            _ => ServerFrame::Other { event, data },
        };
        Ok(frame)
    }
}
