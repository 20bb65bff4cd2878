//! Shared fixtures for the hpmon benchmarks.

use hpmon_hub::{Hub, HubConfig, RoomKey, RoomReceiver};
use hpmon_protocol::{MetricSample, MetricUpdate};
use serde_json::{json, Map, Value};

/// A hub where `subscribers` connections all watch `metric`.
///
/// The receivers must be kept alive for the room to stay populated.
pub fn hub_with_subscribers(metric: &str, subscribers: usize) -> (Hub, Vec<RoomReceiver>) {
    let hub = Hub::with_config(HubConfig {
        max_rooms: usize::MAX,
        ..HubConfig::default()
    });
    let receivers = (0..subscribers)
        .filter_map(|i| {
            let conn = format!("conn-{i}");
            hub.register(&conn);
            hub.subscribe(&conn, RoomKey::metric(metric)).ok().flatten()
        })
        .collect();
    (hub, receivers)
}

/// A map of `count` numeric readings named `metric_0..`.
pub fn readings(count: usize) -> Map<String, Value> {
    (0..count)
        .map(|i| (format!("metric_{i}"), json!(20.0 + i as f64 * 0.1)))
        .collect()
}

/// A burst of single-metric updates cycling over `distinct` metric names.
pub fn sample_burst(len: usize, distinct: usize) -> Vec<MetricUpdate> {
    (0..len)
        .map(|i| {
            MetricUpdate::from(MetricSample::new(
                format!("metric_{}", i % distinct.max(1)),
                json!(i),
                Some(1_700_000_000 + i as i64),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures() {
        let (hub, receivers) = hub_with_subscribers("temp_flow", 3);
        assert_eq!(receivers.len(), 3);
        assert_eq!(hub.member_count(&RoomKey::metric("temp_flow")), 3);

        assert_eq!(readings(4).len(), 4);
        assert_eq!(sample_burst(10, 3).len(), 10);
    }
}
