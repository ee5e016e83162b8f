//! Minimal Matrix room-event models used by the issue bridge.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MATRIX_ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";
pub const MATRIX_REACTION_EVENT_TYPE: &str = "m.reaction";
pub const MATRIX_ROOM_NAME_EVENT_TYPE: &str = "m.room.name";
pub const MATRIX_ROOM_TOPIC_EVENT_TYPE: &str = "m.room.topic";
pub const MATRIX_MSGTYPE_TEXT: &str = "m.text";
pub const MATRIX_MSGTYPE_EMOTE: &str = "m.emote";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
/// Room event as delivered to an application service.
pub struct MatrixRoomEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl MatrixRoomEvent {
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// Decodes `content` as a message when this is a textual `m.room.message`.
    pub fn message_content(&self) -> Option<MatrixMessageContent> {
        if self.event_type != MATRIX_ROOM_MESSAGE_EVENT_TYPE || self.is_state_event() {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MatrixMessageContent {
    pub msgtype: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

impl MatrixMessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MATRIX_MSGTYPE_TEXT.to_string(),
            body: body.into(),
            format: None,
            formatted_body: None,
            external_url: None,
        }
    }
}

/// `m.reaction` content annotating `event_id` with `key`.
pub fn reaction_annotation_content(event_id: &str, key: &str) -> Value {
    json!({
        "m.relates_to": {
            "rel_type": "m.annotation",
            "event_id": event_id,
            "key": key,
        }
    })
}
