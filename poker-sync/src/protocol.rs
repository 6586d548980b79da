//! JSON wire protocol for the planning-poker sync service.
//!
//! Inbound events and outbound messages are internally tagged JSON objects:
//! ```text
//! client → server   {"type": "vote", "value": "5", "roomId": "a1b2"}
//! server → client   {"type": "voted", "userId": "u1"}
//! ```
//!
//! Parsing is fail-soft: the transport enveloping is not uniform across
//! clients, so a payload may arrive either as a raw object or as a
//! JSON-encoded string containing that object. [`decode_payload`] normalizes
//! one level of double-encoding at the boundary; anything that still fails
//! to parse is reported as an error for the caller to log and discard.
//! A malformed event must never take down the connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound client events, tagged by `type`.
///
/// Unknown extra fields (legacy clients stamp `userId` and `roomId` into
/// every event) are ignored; attribution comes from the transport, and the
/// room id is extracted separately via [`room_id_of`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Join a room with a self-declared nickname.
    Join { nickname: String },
    /// Select an estimate card. The value is a card face, e.g. `"5"` or `"?"`.
    Vote { value: String },
    /// Disclose all votes. Facilitator only.
    Reveal,
    /// Start a new round: clears votes, story, and estimate. Facilitator only.
    Reset,
    /// Set the work item under estimation. Empty strings clear. Facilitator only.
    #[serde(rename_all = "camelCase")]
    SetStory {
        story: String,
        #[serde(default)]
        story_url: Option<String>,
    },
    /// Record the agreed final estimate. Facilitator only.
    SetEstimate { estimate: String },
    /// Announced by clients on clean disconnect. Currently a no-op: the
    /// participant entry survives so a page refresh can rejoin seamlessly.
    Leave,
}

/// A room participant as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub nickname: String,
    pub has_voted: bool,
}

/// Full room state, sent to a newly joined connection.
///
/// `votes` is an empty object until the room is revealed — vote secrecy is
/// enforced server-side, so a late joiner cannot observe an in-flight round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<Participant>,
    pub votes: HashMap<String, String>,
    pub is_revealed: bool,
    pub facilitator_id: Option<String>,
    pub story: Option<String>,
    pub story_url: Option<String>,
    pub estimate: Option<String>,
}

/// Outbound server messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Initial state sync for a joining connection.
    RoomState { state: RoomSnapshot },
    /// A new participant joined the room.
    UserJoined { user: Participant },
    /// Reserved: no event path removes a participant yet.
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    /// A participant locked in a vote. The value is withheld until reveal.
    #[serde(rename_all = "camelCase")]
    Voted { user_id: String },
    /// Votes disclosed by the facilitator.
    Revealed { votes: HashMap<String, String> },
    /// Round reset by the facilitator.
    Reset,
    /// Story label/link changed. `null` fields mean cleared.
    #[serde(rename_all = "camelCase")]
    StoryUpdated {
        story: Option<String>,
        story_url: Option<String>,
    },
    /// Final estimate recorded for the current story.
    EstimateSet { estimate: Option<String> },
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Decode a raw inbound frame into a JSON object, tolerating one level of
/// double-encoding (a JSON string whose content is the actual object).
pub fn decode_payload(raw: &str) -> Result<Value, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

    let value = match value {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?,
        other => other,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(ProtocolError::Deserialization(format!(
            "expected a JSON object, got {value}"
        )))
    }
}

/// Extract the room identifier from a decoded payload.
///
/// Accepts both `roomId` and the transport-level `group` alias.
pub fn room_id_of(payload: &Value) -> Option<String> {
    payload
        .get("roomId")
        .or_else(|| payload.get("group"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse a decoded payload into a [`ClientEvent`].
pub fn event_of(payload: Value) -> Result<ClientEvent, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    Transport(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_join_event() {
        let payload = decode_payload(r#"{"type":"join","nickname":"Alice"}"#).unwrap();
        let event = event_of(payload).unwrap();
        assert_eq!(
            event,
            ClientEvent::Join {
                nickname: "Alice".into()
            }
        );
    }

    #[test]
    fn test_decode_ignores_legacy_attribution_fields() {
        // Old clients stamp userId/roomId into every event body.
        let payload =
            decode_payload(r#"{"type":"vote","value":"8","userId":"u2","roomId":"r1"}"#).unwrap();
        assert_eq!(room_id_of(&payload), Some("r1".to_string()));
        let event = event_of(payload).unwrap();
        assert_eq!(event, ClientEvent::Vote { value: "8".into() });
    }

    #[test]
    fn test_decode_double_encoded_payload() {
        // The object arrives as a JSON string containing JSON.
        let raw = serde_json::to_string(r#"{"type":"reveal","group":"r9"}"#).unwrap();
        let payload = decode_payload(&raw).unwrap();
        assert_eq!(room_id_of(&payload), Some("r9".to_string()));
        assert_eq!(event_of(payload).unwrap(), ClientEvent::Reveal);
    }

    #[test]
    fn test_room_id_prefers_room_id_over_group() {
        let payload = decode_payload(r#"{"type":"reset","roomId":"a","group":"b"}"#).unwrap();
        assert_eq!(room_id_of(&payload), Some("a".to_string()));
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        let payload = decode_payload(r#"{"type":"shuffle","roomId":"r1"}"#).unwrap();
        assert!(event_of(payload).is_err());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(decode_payload("42").is_err());
        assert!(decode_payload(r#"["not","an","object"]"#).is_err());
        assert!(decode_payload("not json at all").is_err());
    }

    #[test]
    fn test_set_story_optional_url() {
        let payload = decode_payload(r#"{"type":"setStory","story":"Login"}"#).unwrap();
        assert_eq!(
            event_of(payload).unwrap(),
            ClientEvent::SetStory {
                story: "Login".into(),
                story_url: None
            }
        );

        let payload =
            decode_payload(r#"{"type":"setStory","story":"Login","storyUrl":"http://x/1"}"#)
                .unwrap();
        assert_eq!(
            event_of(payload).unwrap(),
            ClientEvent::SetStory {
                story: "Login".into(),
                story_url: Some("http://x/1".into())
            }
        );
    }

    #[test]
    fn test_server_message_tags_are_camel_case() {
        let msg = ServerMessage::Voted {
            user_id: "u1".into(),
        };
        let encoded = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "voted");
        assert_eq!(value["userId"], "u1");

        let msg = ServerMessage::StoryUpdated {
            story: Some("Checkout".into()),
            story_url: None,
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "storyUpdated");
        assert_eq!(value["story"], "Checkout");
        assert!(value["storyUrl"].is_null());
    }

    #[test]
    fn test_snapshot_field_names() {
        let snapshot = RoomSnapshot {
            room_id: "r1".into(),
            participants: vec![Participant {
                id: "u1".into(),
                nickname: "Alice".into(),
                has_voted: false,
            }],
            votes: HashMap::new(),
            is_revealed: false,
            facilitator_id: Some("u1".into()),
            story: None,
            story_url: None,
            estimate: None,
        };
        let msg = ServerMessage::RoomState { state: snapshot };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "roomState");
        assert_eq!(value["state"]["roomId"], "r1");
        assert_eq!(value["state"]["isRevealed"], false);
        assert_eq!(value["state"]["facilitatorId"], "u1");
        assert_eq!(value["state"]["participants"][0]["hasVoted"], false);
    }
}
