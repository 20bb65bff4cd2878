//! Wire protocol version carried in the `connected` greeting.
//!
//! There is no negotiation. The server stamps [`PROTOCOL_VERSION`] into
//! [`Connected`](crate::Connected) and a client that reads a different
//! major number keeps the session but logs a warning. Greetings from
//! servers that send no version are accepted as-is.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Version spoken by this build of the server and client.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// `major.minor` pair, serialized as `{"major": 1, "minor": 0}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Bumped when frame layouts change incompatibly.
    pub major: u8,
    /// Bumped for additive events or fields.
    pub minor: u8,
}

impl Version {
    /// Version from its parts.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a greeting from `other` can be read without a warning.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Greeting fragment for this version.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({ "major": self.major, "minor": self.minor })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = Version::new(1, 0);
        let v1_3 = Version::new(1, 3);
        let v2_0 = Version::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_3));
        assert!(!v1_3.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_greeting_carries_version() {
        let greeting = crate::Connected::new("conn_1", PROTOCOL_VERSION);
        let value = serde_json::to_value(&greeting).unwrap();
        assert_eq!(value["version"], PROTOCOL_VERSION.to_value());

        let legacy: crate::Connected =
            serde_json::from_value(json!({"status": "connected", "sid": "x"})).unwrap();
        assert!(legacy.version.is_none());
    }

    #[test]
    fn test_version_value_roundtrip() {
        let v: Version = serde_json::from_value(PROTOCOL_VERSION.to_value()).unwrap();
        assert_eq!(v, PROTOCOL_VERSION);
        assert_eq!(v.to_string(), "1.0");
    }
}
