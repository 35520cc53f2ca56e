//! # Wire Messages
//!
//! Every frame on the wire is a JSON object:
//!
//! ```json
//! { "type": "production_data", "timestamp": "2024-05-01T12:00:00Z", "data": { ... } }
//! ```
//!
//! The `type` field is the routing topic. Inbound frames are decoded into a
//! [`Message`] whose [`Payload`] is picked by a [`DecoderRegistry`] keyed on the
//! topic; topics without a decoder are carried as [`Payload::Opaque`].

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Topic that matches every inbound message.
pub const WILDCARD_TOPIC: &str = "*";
/// Per-source sensor readings.
pub const TOPIC_PRODUCTION_DATA: &str = "production_data";
/// Alarm-style events.
pub const TOPIC_ALARM: &str = "message";
pub const TOPIC_SYSTEM_STATUS: &str = "system_status";
/// Outbound keepalive topic.
pub const TOPIC_PING: &str = "ping";
pub const TOPIC_HEARTBEAT: &str = "heartbeat";
pub const TOPIC_PONG: &str = "pong";

/// Current time as an RFC 3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The raw frame shape, used for outbound messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: String,
    pub timestamp: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            timestamp: now_rfc3339(),
            data,
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub timestamp: String,
    pub payload: Payload,
}

/// Typed payloads for the well-known topics.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ProductionData(ProductionData),
    Alarm(AlarmEvent),
    SystemStatus(SystemStatus),
    Heartbeat(Heartbeat),
    /// Any topic without a registered decoder.
    Opaque(Value),
}

/// One reading from a production line.
///
/// The source id is accepted under several spellings used by different
/// producers. Every other key is kept verbatim in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionData {
    #[serde(alias = "source_id", alias = "lineId", alias = "line_id")]
    pub source_id: String,
    /// Epoch milliseconds supplied by the producer.
    #[serde(default, deserialize_with = "deserialize_epoch_ms", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// An alarm raised by a source or by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    #[serde(default, alias = "source_id", alias = "lineId", alias = "line_id")]
    pub source_id: Option<String>,
    #[serde(default, alias = "severity")]
    pub level: Option<String>,
    #[serde(default, alias = "title")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Backend health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Keepalive payload, sent as `ping` and echoed by some servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Parses an epoch-ms timestamp given as a number, a numeric string or an
/// RFC 3339 string.
pub fn parse_epoch_ms(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn deserialize_epoch_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawTimestamp>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawTimestamp::Int(ms)) => Ok(Some(ms)),
        Some(RawTimestamp::Float(ms)) if ms.is_finite() => Ok(Some(ms as i64)),
        Some(RawTimestamp::Float(ms)) => Err(serde::de::Error::custom(format!(
            "timestamp {} is not a finite number",
            ms
        ))),
        Some(RawTimestamp::Text(text)) => parse_epoch_ms(&text).map(Some).ok_or_else(|| {
            serde::de::Error::custom(format!("unrecognised timestamp '{}'", text))
        }),
    }
}

/// Decodes the `data` field of one topic.
pub type Decoder = fn(Value) -> Result<Payload, serde_json::Error>;

/// Maps topic strings to typed decoders.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Decoder>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TOPIC_PRODUCTION_DATA, |v| {
            serde_json::from_value(v).map(Payload::ProductionData)
        });
        registry.register(TOPIC_ALARM, |v| serde_json::from_value(v).map(Payload::Alarm));
        registry.register(TOPIC_SYSTEM_STATUS, |v| {
            serde_json::from_value(v).map(Payload::SystemStatus)
        });
        for topic in [TOPIC_PING, TOPIC_HEARTBEAT, TOPIC_PONG] {
            registry.register(topic, decode_heartbeat);
        }
        registry
    }
}

fn decode_heartbeat(value: Value) -> Result<Payload, serde_json::Error> {
    // Servers often answer a ping with a bare `data: null`.
    if value.is_null() {
        return Ok(Payload::Heartbeat(Heartbeat {
            client_id: None,
            last_heartbeat: None,
        }));
    }
    serde_json::from_value(value).map(Payload::Heartbeat)
}

impl DecoderRegistry {
    /// A registry that decodes everything as [`Payload::Opaque`].
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers (or replaces) the decoder for `topic`.
    pub fn register(&mut self, topic: &str, decoder: Decoder) {
        self.decoders.insert(topic.to_string(), decoder);
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.decoders.contains_key(topic)
    }

    pub fn decode(&self, topic: &str, data: Value) -> Result<Payload, ProtocolError> {
        match self.decoders.get(topic) {
            Some(decoder) => decoder(data).map_err(|source| ProtocolError::InvalidPayload {
                topic: topic.to_string(),
                source,
            }),
            None => Ok(Payload::Opaque(data)),
        }
    }

    /// Parses one text frame into a [`Message`].
    ///
    /// A frame without a non-empty string `type` is rejected with
    /// [`ProtocolError::MissingTopic`]. A missing `timestamp` is filled with
    /// the receive time and a missing `data` decodes as `null`.
    pub fn parse_frame(&self, text: &str) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::MissingTopic);
        };

        let topic = match object.remove("type") {
            Some(Value::String(topic)) if !topic.is_empty() => topic,
            _ => return Err(ProtocolError::MissingTopic),
        };
        let timestamp = match object.remove("timestamp") {
            Some(Value::String(ts)) => ts,
            Some(Value::Number(n)) => n.to_string(),
            _ => now_rfc3339(),
        };
        let data = object.remove("data").unwrap_or(Value::Null);
        let payload = self.decode(&topic, data)?;

        Ok(Message {
            topic,
            timestamp,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_production_data_decodes_with_aliases_and_fields() {
        let registry = DecoderRegistry::default();
        let frame = json!({
            "type": "production_data",
            "timestamp": "2024-05-01T12:00:00Z",
            "data": { "line_id": "L1", "timestamp": 1714564800000i64, "speed": 12.5, "count": 3 }
        })
        .to_string();

        let message = registry.parse_frame(&frame).unwrap();
        assert_eq!(message.topic, "production_data");
        let Payload::ProductionData(data) = message.payload else {
            panic!("expected production data");
        };
        assert_eq!(data.source_id, "L1");
        assert_eq!(data.timestamp, Some(1_714_564_800_000));
        assert_eq!(data.fields.get("speed"), Some(&json!(12.5)));
        assert!(!data.fields.contains_key("line_id"));
    }

    #[test]
    fn test_production_data_accepts_iso_timestamp() {
        let data: ProductionData = serde_json::from_value(json!({
            "sourceId": "A",
            "timestamp": "2024-05-01T12:00:00.250Z"
        }))
        .unwrap();
        assert_eq!(data.timestamp, Some(1_714_564_800_250));
    }

    #[test]
    fn test_production_data_without_source_is_invalid_payload() {
        let registry = DecoderRegistry::default();
        let err = registry
            .parse_frame(r#"{"type":"production_data","timestamp":"x","data":{"speed":1}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_frame_without_type_is_missing_topic() {
        let registry = DecoderRegistry::default();
        let err = registry.parse_frame(r#"{"timestamp":"x","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTopic));
        let err = registry.parse_frame(r#"{"type":"","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTopic));
        let err = registry.parse_frame("[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTopic));
    }

    #[test]
    fn test_unparseable_frame_is_malformed() {
        let registry = DecoderRegistry::default();
        let err = registry.parse_frame("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_unknown_topic_is_opaque() {
        let registry = DecoderRegistry::default();
        let message = registry
            .parse_frame(r#"{"type":"custom","timestamp":"t","data":{"a":1}}"#)
            .unwrap();
        assert_eq!(message.payload, Payload::Opaque(json!({"a": 1})));
    }

    #[test]
    fn test_custom_decoder_overrides_default() {
        let mut registry = DecoderRegistry::empty();
        assert!(!registry.is_registered("production_data"));
        registry.register("production_data", |v| Ok(Payload::Opaque(v)));
        let message = registry
            .parse_frame(r#"{"type":"production_data","timestamp":"t","data":{"x":1}}"#)
            .unwrap();
        assert!(matches!(message.payload, Payload::Opaque(_)));
    }

    #[test]
    fn test_pong_with_null_data_is_heartbeat() {
        let registry = DecoderRegistry::default();
        let message = registry.parse_frame(r#"{"type":"pong","timestamp":"t"}"#).unwrap();
        assert!(matches!(message.payload, Payload::Heartbeat(_)));
    }

    #[test]
    fn test_envelope_serialises_type_field() {
        let envelope = Envelope::new("ping", json!({"client_id": "c"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["data"]["client_id"], "c");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
