use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelName;
use crate::protocol::Envelope;

#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    /// The store could not be reached; cross-process effects of the current
    /// operation are lost but local delivery proceeds.
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A message received from a pub/sub topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
}

/// Fan-out event published between server instances.
///
/// Every variant carries the origin server id; receivers drop events they
/// published themselves, since those were already delivered locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum PeerEvent {
    Channel {
        channel: ChannelName,
        envelope: Envelope,
        origin: String,
    },
    Tenant {
        tenant_id: String,
        envelope: Envelope,
        origin: String,
    },
    User {
        tenant_id: String,
        user_id: String,
        envelope: Envelope,
        origin: String,
    },
}

impl PeerEvent {
    pub fn origin(&self) -> &str {
        match self {
            PeerEvent::Channel { origin, .. } => origin,
            PeerEvent::Tenant { origin, .. } => origin,
            PeerEvent::User { origin, .. } => origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_event_round_trip() {
        let channel = ChannelName::parse("t1:alerts").unwrap();
        let event = PeerEvent::Channel {
            channel: channel.clone(),
            envelope: Envelope::notification(channel, serde_json::json!({"level": "high"})),
            origin: "vantage-a".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: PeerEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.origin(), "vantage-a");
        assert!(matches!(parsed, PeerEvent::Channel { .. }));
    }

    #[test]
    fn test_peer_event_scope_tag() {
        let event = PeerEvent::Tenant {
            tenant_id: "t1".to_string(),
            envelope: Envelope::heartbeat(),
            origin: "vantage-b".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["scope"], "tenant");
        assert_eq!(json["tenant_id"], "t1");
    }
}
