//! Client-side instrumentation.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, histogram};

use crate::state::ConnectionState;

/// Metric names.
pub mod names {
    pub const STATE_TRANSITIONS_TOTAL: &str = "hpmon_client_state_transitions_total";
    pub const BUFFERED_UPDATES_TOTAL: &str = "hpmon_client_buffered_updates_total";
    pub const FLUSHES_TOTAL: &str = "hpmon_client_flushes_total";
    pub const BATCH_SIZE: &str = "hpmon_client_batch_size";
}

/// Describe the client metrics to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::STATE_TRANSITIONS_TOTAL,
        "Connection state transitions, by target state"
    );
    metrics::describe_counter!(
        names::BUFFERED_UPDATES_TOTAL,
        "Metric values merged into the update buffer"
    );
    metrics::describe_counter!(names::FLUSHES_TOTAL, "Batched metric_update notifications");
    metrics::describe_histogram!(names::BATCH_SIZE, "Metrics per batched notification");
}

pub(crate) fn record_transition(state: ConnectionState) {
    counter!(names::STATE_TRANSITIONS_TOTAL, "state" => state.as_str()).increment(1);
}

pub(crate) fn record_buffered(count: usize) {
    counter!(names::BUFFERED_UPDATES_TOTAL).increment(count as u64);
}

pub(crate) fn record_flush(batch_size: usize) {
    counter!(names::FLUSHES_TOTAL).increment(1);
    histogram!(names::BATCH_SIZE).record(batch_size as f64);
}
