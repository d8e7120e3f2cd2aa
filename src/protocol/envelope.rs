use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelName;
use crate::presence::{PresenceRecord, PresenceStatus};

/// Envelope type discriminator, shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Subscribe,
    Unsubscribe,
    Message,
    Ping,
    Pong,
    Error,
    Notification,
    Heartbeat,
    Reconnect,
}

impl EnvelopeKind {
    /// SSE `event:` field name for this envelope kind.
    pub fn sse_event(&self) -> &'static str {
        match self {
            EnvelopeKind::Subscribe => "subscribed",
            EnvelopeKind::Unsubscribe => "unsubscribed",
            EnvelopeKind::Message => "message",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Notification => "notification",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Reconnect => "reconnect",
        }
    }
}

/// Typed payloads carried in the envelope `data` field.
///
/// Tagged by `type` so clients can dispatch without inspecting the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    Connected {
        connection_id: Uuid,
        server_time: DateTime<Utc>,
    },
    PresenceUpdate {
        user_id: String,
        tenant_id: String,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    Subscribed {
        channel: ChannelName,
        subscribers: usize,
    },
    Unsubscribed {
        channel: ChannelName,
    },
    Error {
        code: String,
        message: String,
    },
    Shutdown {
        reason: String,
    },
    /// Opaque application payload (metric changes, alerts, ...).
    Notification {
        payload: serde_json::Value,
    },
}

/// The message exchanged between server and clients.
///
/// Immutable once constructed; fan-out shares one `Arc<Envelope>` across all
/// recipient connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
    pub timestamp: DateTime<Utc>,
    /// Reconnect delay hint in milliseconds (SSE `retry:` field).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl Envelope {
    fn new(kind: EnvelopeKind, channel: Option<ChannelName>, data: Option<EventData>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            channel,
            data,
            timestamp: Utc::now(),
            retry: None,
        }
    }

    /// First frame after a successful handshake.
    pub fn connected(connection_id: Uuid) -> Self {
        Self::new(
            EnvelopeKind::Message,
            None,
            Some(EventData::Connected {
                connection_id,
                server_time: Utc::now(),
            }),
        )
    }

    pub fn notification(channel: ChannelName, payload: serde_json::Value) -> Self {
        Self::new(
            EnvelopeKind::Notification,
            Some(channel),
            Some(EventData::Notification { payload }),
        )
    }

    pub fn presence_update(record: &PresenceRecord) -> Self {
        Self::new(
            EnvelopeKind::Notification,
            None,
            Some(EventData::PresenceUpdate {
                user_id: record.user_id.clone(),
                tenant_id: record.tenant_id.clone(),
                status: record.status,
                last_seen: record.last_seen,
            }),
        )
    }

    pub fn subscribed(channel: ChannelName, subscribers: usize) -> Self {
        Self::new(
            EnvelopeKind::Subscribe,
            Some(channel.clone()),
            Some(EventData::Subscribed {
                channel,
                subscribers,
            }),
        )
    }

    pub fn unsubscribed(channel: ChannelName) -> Self {
        Self::new(
            EnvelopeKind::Unsubscribe,
            Some(channel.clone()),
            Some(EventData::Unsubscribed { channel }),
        )
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::Error,
            None,
            Some(EventData::Error {
                code: code.into(),
                message: message.into(),
            }),
        )
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping, None, None)
    }

    pub fn pong() -> Self {
        Self::new(EnvelopeKind::Pong, None, None)
    }

    pub fn heartbeat() -> Self {
        Self::new(EnvelopeKind::Heartbeat, None, None)
    }

    /// Graceful-shutdown envelope telling clients to reconnect elsewhere.
    pub fn reconnect(reason: impl Into<String>, retry_ms: u64) -> Self {
        let mut envelope = Self::new(
            EnvelopeKind::Reconnect,
            None,
            Some(EventData::Shutdown {
                reason: reason.into(),
            }),
        );
        envelope.retry = Some(retry_ms);
        envelope
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Messages sent from client to server over the bidirectional transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    /// Client publish into a channel it has permission to publish on.
    Message {
        channel: String,
        data: serde_json::Value,
    },
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_envelope_shape() {
        let envelope = Envelope::connected(Uuid::new_v4());
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "message");
        assert_eq!(json["data"]["type"], "connected");
        assert!(json.get("channel").is_none());
        assert!(json.get("retry").is_none());
    }

    #[test]
    fn test_notification_round_trip() {
        let channel = ChannelName::qualify("metrics", "t1").unwrap();
        let envelope = Envelope::notification(channel, serde_json::json!({"value": 42}));

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, EnvelopeKind::Notification);
        assert_eq!(parsed.channel.unwrap().as_str(), "t1:metrics");
        match parsed.data {
            Some(EventData::Notification { payload }) => {
                assert_eq!(payload["value"], 42);
            }
            other => panic!("unexpected data: {other:?}"),
        }
    }

    #[test]
    fn test_reconnect_carries_retry_hint() {
        let envelope = Envelope::reconnect("deploy", 5000);
        assert_eq!(envelope.kind, EnvelopeKind::Reconnect);
        assert_eq!(envelope.retry, Some(5000));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["retry"], 5000);
        assert_eq!(json["data"]["type"], "shutdown");
    }

    #[test]
    fn test_client_envelope_parsing() {
        let msg: ClientEnvelope =
            serde_json::from_str(r#"{"type":"subscribe","channel":"metrics"}"#).unwrap();
        assert!(matches!(msg, ClientEnvelope::Subscribe { channel } if channel == "metrics"));

        let msg: ClientEnvelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientEnvelope::Ping));

        let msg: ClientEnvelope = serde_json::from_str(
            r#"{"type":"message","channel":"t1:metrics","data":{"value":1}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientEnvelope::Message { .. }));

        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_sse_event_names() {
        assert_eq!(EnvelopeKind::Subscribe.sse_event(), "subscribed");
        assert_eq!(EnvelopeKind::Notification.sse_event(), "notification");
        assert_eq!(EnvelopeKind::Reconnect.sse_event(), "reconnect");
    }
}
