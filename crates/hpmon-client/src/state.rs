//! Connection state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected to the server.
    Connected,
    /// Connection lost; waiting for or making a reconnect attempt.
    Reconnecting,
    /// Connecting failed or the reconnect budget is spent.
    Error,
}

impl ConnectionState {
    /// Wire/display name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, serde_json::Value::String(state.to_string()));
        }
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
