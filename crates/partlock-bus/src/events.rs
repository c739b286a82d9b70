//! Event names and wire types shared with out-of-process providers.

use partlock_block::Partition;
use serde::{Deserialize, Serialize};

/// Passphrase discovery request, answered by exactly one provider.
pub const EVENT_DISCOVERY_PASSWORD: &str = "discovery.password";

/// Envelope written to a provider's standard input. The payload travels as a
/// JSON-encoded string so providers can defer parsing until they know the
/// event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub name: String,
    pub data: String,
}

/// Response read from a provider's standard output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

impl EventResponse {
    /// Whether the provider flagged the request as failed.
    pub fn errored(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Payload of [`EVENT_DISCOVERY_PASSWORD`]: the partition being unlocked plus
/// the remote-KMS coordinates from the effective config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub partition: Partition,
    #[serde(default)]
    pub challenger_server: String,
    #[serde(default)]
    pub mdns: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_errored_only_with_error_text() {
        assert!(!EventResponse::default().errored());
        let response = EventResponse {
            error: "boom".to_string(),
            ..EventResponse::default()
        };
        assert!(response.errored());
    }

    #[test]
    fn payload_round_trips_partition_fields() {
        let payload = DiscoveryPayload {
            partition: Partition {
                name: "sda1".to_string(),
                filesystem_label: "COS_PERSISTENT".to_string(),
                uuid: "666".to_string(),
                ..Partition::default()
            },
            challenger_server: "https://kms.example".to_string(),
            mdns: false,
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: DiscoveryPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.partition.name, "sda1");
        assert_eq!(decoded.partition.filesystem_label, "COS_PERSISTENT");
        assert_eq!(decoded.challenger_server, "https://kms.example");
    }
}
