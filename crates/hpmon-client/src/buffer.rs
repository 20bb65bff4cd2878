//! Pending metric updates.

use hpmon_protocol::MetricUpdate;
use serde_json::{Map, Value};

/// Metric updates received during the current debounce window.
///
/// Later updates for a key overwrite earlier ones.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateBuffer {
    pending: Map<String, Value>,
}

impl UpdateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update into the buffer. Returns the number of keys written.
    pub fn merge(&mut self, update: MetricUpdate) -> usize {
        let entries = update.into_entries();
        let written = entries.len();
        self.pending.extend(entries);
        written
    }

    /// Take everything buffered, leaving the buffer empty.
    pub fn take(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpmon_protocol::MetricSample;
    use serde_json::json;

    fn sample(metric: &str, value: f64) -> MetricUpdate {
        MetricUpdate::from(MetricSample::new(metric, json!(value), Some(1_700_000_000)))
    }

    #[test]
    fn test_sample_keyed_by_metric() {
        let mut buffer = UpdateBuffer::new();
        buffer.merge(sample("temp_flow", 35.0));

        let batch = buffer.take();
        assert_eq!(
            batch["temp_flow"],
            json!({"metric": "temp_flow", "value": 35.0, "timestamp": 1_700_000_000})
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let mut buffer = UpdateBuffer::new();
        buffer.merge(sample("temp_flow", 35.0));
        buffer.merge(sample("temp_flow", 36.5));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.take()["temp_flow"]["value"], json!(36.5));
    }

    #[test]
    fn test_raw_sample_kept_whole() {
        let update: MetricUpdate = serde_json::from_value(json!({
            "metric": "temp_flow",
            "value": 35.0,
            "timestamp": 1_700_000_000.25,
            "unit": "C"
        }))
        .unwrap();

        let mut buffer = UpdateBuffer::new();
        assert_eq!(buffer.merge(update), 1);

        let batch = buffer.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch["temp_flow"]["unit"], json!("C"));
        assert_eq!(batch["temp_flow"]["timestamp"], json!(1_700_000_000.25));
    }

    #[test]
    fn test_batch_merges_each_key() {
        let mut buffer = UpdateBuffer::new();
        buffer.merge(sample("temp_flow", 35.0));

        let mut map = Map::new();
        map.insert("temp_outside".into(), json!(4.5));
        map.insert("temp_flow".into(), json!(34.0));
        assert_eq!(buffer.merge(MetricUpdate::Batch(map)), 2);

        let batch = buffer.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch["temp_outside"], json!(4.5));
        assert_eq!(batch["temp_flow"], json!(34.0));
    }
}
