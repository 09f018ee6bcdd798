//! Binary envelope for the realtime relay protocol.
//!
//! Wire format (bincode-encoded envelope, JSON payload):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────────────────┐
//! │ msg_type │ topic     │ reference │ payload              │
//! │ 1 byte   │ len + str │ varint    │ len + JSON bytes     │
//! └──────────┴───────────┴───────────┴──────────────────────┘
//! ```
//!
//! The envelope is typed; the payload is deliberately kept as raw JSON.
//! CDC payloads in particular are not shape-checked on the wire and only
//! become [`ChangeEvent`](crate::event::ChangeEvent)s after normalization.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::channel::{CdcBinding, DeliveryModes};

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client joins a topic with its CDC bindings and delivery modes
    Subscribe = 1,
    /// Relay accepted the subscription (`reference` echoes the request)
    SubscribeAck = 2,
    /// Relay refused the subscription
    SubscribeError = 3,
    /// Client leaves a topic
    Unsubscribe = 4,
    /// Producer pushes a raw row change into the relay
    Publish = 5,
    /// Relay delivers a raw row change to a subscriber
    Change = 6,
    /// Ephemeral peer event
    Broadcast = 7,
    /// Client announces its own presence on a topic
    Track = 8,
    /// Client withdraws its presence
    Untrack = 9,
    /// Full presence snapshot for a topic
    PresenceState = 10,
    /// Incremental presence joins/leaves
    PresenceDiff = 11,
    /// Heartbeat ping
    Ping = 12,
    /// Heartbeat pong
    Pong = 13,
}

/// Presence entry as carried on the wire: `{userId, metadata, onlineAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    pub user_id: String,
    #[serde(default)]
    pub metadata: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub online_at: u64,
}

impl PresenceMeta {
    pub fn new(user_id: impl Into<String>, online_at: u64) -> Self {
        Self {
            user_id: user_id.into(),
            metadata: Value::Object(Default::default()),
            online_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub modes: DeliveryModes,
    #[serde(default)]
    pub bindings: Vec<CdcBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiffPayload {
    #[serde(default)]
    pub joins: Vec<PresenceMeta>,
    #[serde(default)]
    pub leaves: Vec<PresenceMeta>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceStatePayload {
    #[serde(default)]
    pub presences: Vec<PresenceMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub topic: String,
    /// Request correlation: the channel handle for subscribe traffic.
    pub reference: u64,
    /// JSON payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_json<T: Serialize>(
        msg_type: MessageType,
        topic: &str,
        reference: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            topic: topic.to_string(),
            reference,
            payload,
        })
    }

    fn bare(msg_type: MessageType, topic: &str, reference: u64) -> Self {
        Self {
            msg_type,
            topic: topic.to_string(),
            reference,
            payload: Vec::new(),
        }
    }

    pub fn subscribe(
        topic: &str,
        reference: u64,
        body: &SubscribePayload,
    ) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Subscribe, topic, reference, body)
    }

    pub fn subscribe_ack(topic: &str, reference: u64) -> Self {
        Self::bare(MessageType::SubscribeAck, topic, reference)
    }

    pub fn subscribe_error(
        topic: &str,
        reference: u64,
        reason: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let body = ErrorPayload {
            reason: reason.into(),
        };
        Self::with_json(MessageType::SubscribeError, topic, reference, &body)
    }

    pub fn unsubscribe(topic: &str, reference: u64) -> Self {
        Self::bare(MessageType::Unsubscribe, topic, reference)
    }

    /// Raw row change pushed by a producer. `raw` is forwarded untouched.
    pub fn publish(raw: &Value) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Publish, "", 0, raw)
    }

    pub fn change(topic: &str, raw: &Value) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Change, topic, 0, raw)
    }

    pub fn broadcast(topic: &str, event: &str, payload: Value) -> Result<Self, ProtocolError> {
        let body = BroadcastPayload {
            event: event.to_string(),
            payload,
        };
        Self::with_json(MessageType::Broadcast, topic, 0, &body)
    }

    pub fn track(topic: &str, meta: &PresenceMeta) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Track, topic, 0, meta)
    }

    pub fn untrack(topic: &str) -> Self {
        Self::bare(MessageType::Untrack, topic, 0)
    }

    pub fn presence_state(
        topic: &str,
        body: &PresenceStatePayload,
    ) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::PresenceState, topic, 0, body)
    }

    pub fn presence_diff(topic: &str, body: &PresenceDiffPayload) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::PresenceDiff, topic, 0, body)
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping, "", 0)
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong, "", 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON payload into a typed body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the JSON payload without imposing a shape.
    pub fn raw_body(&self) -> Result<Value, ProtocolError> {
        self.body::<Value>()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RowFilter;
    use fleet_model::TableName;
    use serde_json::json;

    #[test]
    fn test_subscribe_roundtrip() {
        let body = SubscribePayload {
            modes: DeliveryModes::ALL,
            bindings: vec![CdcBinding::filtered(
                TableName::from("messages"),
                RowFilter::eq("room_id", "roomA"),
            )],
        };
        let msg = SyncMessage::subscribe("room:roomA", 7, &body).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Subscribe);
        assert_eq!(decoded.topic, "room:roomA");
        assert_eq!(decoded.reference, 7);
        assert_eq!(decoded.body::<SubscribePayload>().unwrap(), body);
    }

    #[test]
    fn test_change_payload_is_untouched() {
        // Not a valid change event; the envelope must not care.
        let raw = json!({"table": "messages", "weird": [1, 2]});
        let msg = SyncMessage::change("room:a", &raw).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.raw_body().unwrap(), raw);
    }

    #[test]
    fn test_presence_meta_wire_names() {
        let meta = PresenceMeta::new("u1", 1_700_000_000_000);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["onlineAt"], 1_700_000_000_000u64);
        assert!(value["metadata"].is_object());
    }

    #[test]
    fn test_broadcast_body() {
        let msg = SyncMessage::broadcast("room:a", "typing", json!({"userId": "u1"})).unwrap();
        let body: BroadcastPayload = msg.body().unwrap();
        assert_eq!(body.event, "typing");
        assert_eq!(body.payload["userId"], "u1");
    }

    #[test]
    fn test_bare_messages_have_empty_payload() {
        assert!(SyncMessage::ping().payload.is_empty());
        assert!(SyncMessage::unsubscribe("t", 1).payload.is_empty());
        assert_eq!(SyncMessage::subscribe_ack("t", 9).reference, 9);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_body_type_mismatch() {
        let msg = SyncMessage::ping();
        assert!(matches!(
            msg.body::<BroadcastPayload>(),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Subscribe as u8, 1);
        assert_eq!(MessageType::Change as u8, 6);
        assert_eq!(MessageType::Pong as u8, 13);
    }
}
