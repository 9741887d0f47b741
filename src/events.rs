//! Wire-level event types for the WebSocket relay.
//!
//! Every frame in both directions is a JSON object. Inbound frames carry a
//! `type` discriminator (absent means `new_message`); outbound frames are
//! either a typed event or a bare `{"error": "..."}` object scoped to the
//! request that caused it.

use crate::db::{Message, MessageKind, MessageStatus};
use serde::{Deserialize, Serialize};

/// A message as it appears on the wire. Content is carried as text;
/// undecodable bytes are replaced rather than dropped.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageBody {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: i64,
    pub status: MessageStatus,
    pub is_pinned: bool,
    pub is_edited: bool,
    pub reply_to_id: Option<i64>,
}

impl From<&Message> for MessageBody {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            chat_id: m.chat_id,
            sender_id: m.sender_id,
            content: String::from_utf8_lossy(&m.content).into_owned(),
            kind: m.kind,
            sent_at: m.sent_at,
            status: m.status,
            is_pinned: m.is_pinned,
            is_edited: m.is_edited,
            reply_to_id: m.reply_to_id,
        }
    }
}

/// Server-to-client event, fanned out to chat participants or watchers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    NewMessage {
        message: MessageBody,
    },
    MessageRead {
        chat_id: i64,
        reader_id: i64,
        last_read_message_id: i64,
    },
    MessageEdited {
        message: MessageBody,
    },
    MessageDeleted {
        chat_id: i64,
        message_id: i64,
    },
    MessagePinned {
        chat_id: i64,
        message_id: i64,
        is_pinned: bool,
    },
    UserStatus {
        user_id: i64,
        is_online: bool,
        last_seen_at: i64,
    },
}

/// Anything the server writes to a socket.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Event(ChatEvent),
    /// Scoped failure for one inbound frame; the connection stays up.
    Error {
        error: String,
    },
}

impl Outbound {
    /// Encode for the wire. Serialization of these types cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"internal"}"#.to_string())
    }
}

// Inbound request payloads, one per `type` discriminator. The relay parses
// the discriminator itself so it can name unknown types in the error.

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub content: String,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    pub chat_id: i64,
    /// Highest message id the client has seen.
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub message_id: i64,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub message_id: i64,
    #[serde(default = "default_pinned")]
    pub is_pinned: bool,
}

fn default_pinned() -> bool {
    true
}
