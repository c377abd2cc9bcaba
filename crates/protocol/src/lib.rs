//! Realtime protocol: the JSON envelope exchanged over the progress
//! WebSocket, plus the reserved control messages both sides understand.
//!
//! Every frame on the wire is a flat JSON object with a string `type`
//! discriminator.  Everything besides `type` is payload and opaque to the
//! transport.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Topic that receives every inbound envelope regardless of its `type`.
pub const WILDCARD_TOPIC: &str = "message";

/// Normal closure (RFC 6455 §7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;
/// No status code was present in the close frame.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Default cap on a single inbound frame (1 MiB).
pub const DEFAULT_MAX_INBOUND_BYTES: usize = 1024 * 1024;

/// Reserved `type` names.
pub mod types {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const ROOM_JOINED: &str = "room_joined";
    pub const ROOM_LEFT: &str = "room_left";
    pub const ERROR: &str = "error";
}

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// Wire message unit: `{ "type": <kind>, ...payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope.  A `type` key inside `payload` is discarded so the
    /// discriminator can never be shadowed.
    pub fn new(kind: impl Into<String>, mut payload: Map<String, Value>) -> Self {
        payload.remove("type");
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Envelope with no payload fields.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, Map::new())
    }

    /// Build an envelope from a JSON value.  Non-object payloads are wrapped
    /// under a `data` key.
    pub fn with_value(kind: impl Into<String>, payload: Value) -> Self {
        match payload {
            Value::Object(map) => Self::new(kind, map),
            Value::Null => Self::bare(kind),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                Self::new(kind, map)
            }
        }
    }

    /// Heartbeat probe.
    pub fn ping() -> Self {
        let mut payload = Map::new();
        payload.insert("timestamp".into(), Value::from(Utc::now().timestamp_millis()));
        Self::new(types::PING, payload)
    }

    pub fn join_room(room: &str) -> Self {
        Self::room_control(types::JOIN_ROOM, room)
    }

    pub fn leave_room(room: &str) -> Self {
        Self::room_control(types::LEAVE_ROOM, room)
    }

    fn room_control(kind: &str, room: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("room".into(), Value::from(room));
        Self::new(kind, payload)
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn parse_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        match map.remove("type") {
            Some(Value::String(kind)) => Ok(Self { kind, payload: map }),
            _ => Err(ProtocolError::MissingType),
        }
    }

    /// Payload as a JSON object value.
    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    /// Whole envelope (including `type`) as a JSON value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.payload.len() + 1);
        map.insert("type".into(), Value::String(self.kind.clone()));
        map.extend(self.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(map)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Typed view of a reserved inbound control message, if this is one.
    ///
    /// Recognition goes by `type` alone.  `pong` and `error` are always
    /// recognized whatever their payload looks like; `connection_established`
    /// and the room acks need their id / room field and are skipped without it.
    pub fn control(&self) -> Option<ControlMessage> {
        match self.kind.as_str() {
            types::PONG => Some(ControlMessage::Pong {
                timestamp: self.payload.get("timestamp").cloned(),
            }),
            types::CONNECTION_ESTABLISHED => self
                .text_field("connection_id")
                .map(|connection_id| ControlMessage::ConnectionEstablished { connection_id }),
            types::ROOM_JOINED => self.text_field("room").map(|room| ControlMessage::RoomJoined { room }),
            types::ROOM_LEFT => self.text_field("room").map(|room| ControlMessage::RoomLeft { room }),
            types::ERROR => {
                let message = match self.payload.get("message") {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                };
                Some(ControlMessage::Error { message })
            }
            _ => None,
        }
    }

    /// String field, or a number rendered as text.
    fn text_field(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Inbound control messages the client tracks for its own bookkeeping.
///
/// These are still delivered to subscribers like any other envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Heartbeat answer.  The echoed timestamp is passed through untouched.
    Pong { timestamp: Option<Value> },
    ConnectionEstablished { connection_id: String },
    RoomJoined { room: String },
    RoomLeft { room: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_keeps_extra_fields_as_payload() {
        let env = Envelope::parse(r#"{"type":"progress_update","data":{"step":2},"run":"r1"}"#)
            .unwrap();
        assert_eq!(env.kind, "progress_update");
        assert_eq!(env.payload["data"], json!({"step": 2}));
        assert_eq!(env.payload["run"], json!("r1"));
        assert!(!env.payload.contains_key("type"));
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        assert!(matches!(Envelope::parse("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(Envelope::parse("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(Envelope::parse(r#"{"data":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(Envelope::parse(r#"{"type":7}"#), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn parse_slice_accepts_utf8_json() {
        let env = Envelope::parse_slice(br#"{"type":"pong"}"#).unwrap();
        assert_eq!(env.kind, "pong");
    }

    #[test]
    fn serializes_flat() {
        let env = Envelope::join_room("pipeline-42");
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "join_room", "room": "pipeline-42"}));
        assert_eq!(env.to_value(), value);
    }

    #[test]
    fn new_strips_type_from_payload() {
        let mut payload = Map::new();
        payload.insert("type".into(), json!("spoofed"));
        payload.insert("x".into(), json!(1));
        let env = Envelope::new("real", payload);
        assert_eq!(env.to_value(), json!({"type": "real", "x": 1}));
    }

    #[test]
    fn with_value_wraps_scalars() {
        let env = Envelope::with_value("note", json!("hi"));
        assert_eq!(env.payload["data"], json!("hi"));
        let env = Envelope::with_value("note", Value::Null);
        assert!(env.payload.is_empty());
    }

    #[test]
    fn ping_carries_timestamp() {
        let env = Envelope::ping();
        assert_eq!(env.kind, types::PING);
        assert!(env.payload["timestamp"].is_i64());
    }

    #[test]
    fn control_recognizes_reserved_types() {
        let env = Envelope::parse(r#"{"type":"connection_established","connection_id":"c-1"}"#)
            .unwrap();
        assert_eq!(
            env.control(),
            Some(ControlMessage::ConnectionEstablished {
                connection_id: "c-1".into()
            })
        );

        let env = Envelope::parse(r#"{"type":"room_joined","room":"a"}"#).unwrap();
        assert_eq!(env.control(), Some(ControlMessage::RoomJoined { room: "a".into() }));

        let env = Envelope::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(env.control(), Some(ControlMessage::Pong { timestamp: None }));

        let env = Envelope::parse(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(env.control(), Some(ControlMessage::Error { message: "boom".into() }));
    }

    #[test]
    fn control_ignores_application_types_and_bad_shapes() {
        let env = Envelope::parse(r#"{"type":"progress_update"}"#).unwrap();
        assert!(env.control().is_none());
        // room_joined without a room is not usable for bookkeeping
        let env = Envelope::parse(r#"{"type":"room_joined"}"#).unwrap();
        assert!(env.control().is_none());
        let env = Envelope::parse(r#"{"type":"room_left","room":["a"]}"#).unwrap();
        assert!(env.control().is_none());
    }

    #[test]
    fn pong_is_recognized_whatever_its_timestamp() {
        for frame in [
            r#"{"type":"pong","timestamp":"2026-10-16T12:00:00Z"}"#,
            r#"{"type":"pong","timestamp":1.5}"#,
            r#"{"type":"pong","timestamp":null}"#,
            r#"{"type":"pong","timestamp":{"ms":1}}"#,
        ] {
            let env = Envelope::parse(frame).unwrap();
            assert!(
                matches!(env.control(), Some(ControlMessage::Pong { .. })),
                "{frame}"
            );
        }
        let env = Envelope::parse(r#"{"type":"pong","timestamp":"t"}"#).unwrap();
        assert_eq!(
            env.control(),
            Some(ControlMessage::Pong { timestamp: Some(json!("t")) })
        );
    }

    #[test]
    fn error_and_ids_tolerate_non_string_payloads() {
        let env = Envelope::parse(r#"{"type":"error","message":{"code":42}}"#).unwrap();
        assert_eq!(
            env.control(),
            Some(ControlMessage::Error { message: r#"{"code":42}"#.into() })
        );
        let env = Envelope::parse(r#"{"type":"error"}"#).unwrap();
        assert_eq!(env.control(), Some(ControlMessage::Error { message: String::new() }));

        let env = Envelope::parse(r#"{"type":"connection_established","connection_id":17}"#)
            .unwrap();
        assert_eq!(
            env.control(),
            Some(ControlMessage::ConnectionEstablished { connection_id: "17".into() })
        );
    }
}
