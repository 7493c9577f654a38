use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::FrameError,
};

/// Frames written by the client onto a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { content: String },
    Typing { is_typing: bool },
    Read,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message { .. } => "message",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::Read => "read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderSummary>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_edited: bool,
}

/// One page of the REST message history, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default)]
    pub results: Vec<MessagePayload>,
}

/// Frames pushed by the server on a conversation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        message: MessagePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Typing {
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        username: String,
        is_online: bool,
    },
    ReadReceipt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    ConversationClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    Error {
        #[serde(default, alias = "message")]
        error: Option<String>,
    },
}

const KNOWN_SERVER_KINDS: &[&str] = &[
    "message",
    "typing",
    "presence",
    "read_receipt",
    "conversation_closed",
    "error",
];

/// Legacy kinds still emitted by older servers, mapped to their current name.
fn canonical_kind(kind: &str) -> &str {
    match kind {
        "presence_update" => "presence",
        "read" => "read_receipt",
        other => other,
    }
}

impl ServerFrame {
    /// Classifies one text frame by its `type` field.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let mut value: Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();
        let canonical = canonical_kind(&kind);
        if !KNOWN_SERVER_KINDS.contains(&canonical) {
            return Err(FrameError::UnknownKind(kind));
        }
        if canonical != kind {
            value["type"] = Value::String(canonical.to_string());
        }
        serde_json::from_value(value).map_err(|source| FrameError::Malformed { kind, source })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Message { .. } => "message",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::Presence { .. } => "presence",
            ServerFrame::ReadReceipt { .. } => "read_receipt",
            ServerFrame::ConversationClosed { .. } => "conversation_closed",
            ServerFrame::Error { .. } => "error",
        }
    }
}
