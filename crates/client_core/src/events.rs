use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{MessagePayload, ServerFrame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Message,
    Typing,
    Presence,
    ReadReceipt,
    ConversationClosed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Message,
        EventKind::Typing,
        EventKind::Presence,
        EventKind::ReadReceipt,
        EventKind::ConversationClosed,
        EventKind::Error,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake or socket failure.
    Transport,
    /// Inbound frame that could not be classified.
    Protocol,
    /// `error` frame sent by the server.
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Connected {
        conversation_id: ConversationId,
    },
    Disconnected {
        conversation_id: ConversationId,
        /// Close code from the server, if the channel closed with one.
        code: Option<u16>,
        /// Attempt number of the scheduled reconnect; `None` when no reconnect follows.
        retry_attempt: Option<u32>,
    },
    Message {
        conversation_id: ConversationId,
        message: MessagePayload,
        timestamp: Option<DateTime<Utc>>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    Presence {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        is_online: bool,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        user_id: Option<UserId>,
        username: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    ConversationClosed {
        conversation_id: ConversationId,
        username: Option<String>,
    },
    Error {
        conversation_id: Option<ConversationId>,
        kind: ErrorKind,
        message: String,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::Connected { .. } => EventKind::Connected,
            ChatEvent::Disconnected { .. } => EventKind::Disconnected,
            ChatEvent::Message { .. } => EventKind::Message,
            ChatEvent::Typing { .. } => EventKind::Typing,
            ChatEvent::Presence { .. } => EventKind::Presence,
            ChatEvent::ReadReceipt { .. } => EventKind::ReadReceipt,
            ChatEvent::ConversationClosed { .. } => EventKind::ConversationClosed,
            ChatEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ChatEvent::Connected { conversation_id }
            | ChatEvent::Disconnected {
                conversation_id, ..
            }
            | ChatEvent::Message {
                conversation_id, ..
            }
            | ChatEvent::Typing {
                conversation_id, ..
            }
            | ChatEvent::Presence {
                conversation_id, ..
            }
            | ChatEvent::ReadReceipt {
                conversation_id, ..
            }
            | ChatEvent::ConversationClosed {
                conversation_id, ..
            } => Some(*conversation_id),
            ChatEvent::Error {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub(crate) fn from_frame(conversation_id: ConversationId, frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::Message { message, timestamp } => ChatEvent::Message {
                conversation_id,
                message,
                timestamp,
            },
            ServerFrame::Typing {
                user_id,
                username,
                is_typing,
            } => ChatEvent::Typing {
                conversation_id,
                user_id,
                username,
                is_typing,
            },
            ServerFrame::Presence {
                user_id,
                username,
                is_online,
            } => ChatEvent::Presence {
                conversation_id,
                user_id,
                username,
                is_online,
            },
            ServerFrame::ReadReceipt {
                user_id,
                username,
                timestamp,
            } => ChatEvent::ReadReceipt {
                conversation_id,
                user_id,
                username,
                timestamp,
            },
            ServerFrame::ConversationClosed { username, .. } => ChatEvent::ConversationClosed {
                conversation_id,
                username,
            },
            ServerFrame::Error { error } => ChatEvent::Error {
                conversation_id: Some(conversation_id),
                kind: ErrorKind::Server,
                message: error.unwrap_or_else(|| "server reported an error".to_string()),
            },
        }
    }
}
