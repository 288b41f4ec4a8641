//! Wire events exchanged with clients.
//!
//! Every frame is a JSON text message of the shape
//! `{"event": "<name>", "data": <payload>}`, in both directions.

use crate::store::{Message, MessageKind};
use crate::types::{ConversationId, MessageId, UserId};
use crate::ws::types::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Online state carried by `user:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub chat_id: ConversationId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub is_typing: bool,
}

/// The `message:new` payload: the persisted message without its receipt list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub id: MessageId,
    pub chat_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for NewMessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            chat_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            kind: message.kind,
            reply_to: message.reply_to.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBy {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSeenUpdate {
    pub chat_id: ConversationId,
    pub read_by: ReadBy,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountUpdate {
    pub chat_id: ConversationId,
    pub unread_count: u64,
}

/// Explicit rejection of a single command. The connection stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user:status")]
    UserStatus(UserStatusUpdate),
    #[serde(rename = "typing:update")]
    TypingUpdate(TypingUpdate),
    #[serde(rename = "message:new")]
    MessageNew(NewMessagePayload),
    #[serde(rename = "message:seen")]
    MessageSeen(MessageSeenUpdate),
    #[serde(rename = "chat:unreadUpdate")]
    UnreadUpdate(UnreadCountUpdate),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserStatus(_) => EventKind::UserStatus,
            Self::TypingUpdate(_) => EventKind::TypingUpdate,
            Self::MessageNew(_) => EventKind::MessageNew,
            Self::MessageSeen(_) => EventKind::MessageSeen,
            Self::UnreadUpdate(_) => EventKind::UnreadUpdate,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Serializes the event once so it can be cloned cheaply across a fan-out.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code: code.to_owned(),
            message: message.into(),
        })
    }
}

/// Discriminant of a `ServerEvent`, used to key client-side subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserStatus,
    TypingUpdate,
    MessageNew,
    MessageSeen,
    UnreadUpdate,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserStatus => "user:status",
            Self::TypingUpdate => "typing:update",
            Self::MessageNew => "message:new",
            Self::MessageSeen => "message:seen",
            Self::UnreadUpdate => "chat:unreadUpdate",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkSeen {
    pub chat_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<MessageId>>,
}

/// Client → server commands.
///
/// `chat:join` and `chat:leave` carry the bare conversation id as their data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "typing:start")]
    TypingStart(ChatRef),
    #[serde(rename = "typing:stop")]
    TypingStop(ChatRef),
    #[serde(rename = "chat:join")]
    Join(ConversationId),
    #[serde(rename = "chat:leave")]
    Leave(ConversationId),
    #[serde(rename = "message:markSeen")]
    MarkSeen(MarkSeen),
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::TypingStart(r) | Self::TypingStop(r) => &r.chat_id,
            Self::Join(id) | Self::Leave(id) => id,
            Self::MarkSeen(m) => &m.chat_id,
        }
    }
}
