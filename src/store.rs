//! Contracts for the external collaborators the core consumes, plus an
//! in-memory implementation used by tests and the demo server.
//!
//! The core never owns durable state. Messages and receipts live behind
//! [`MessageStore`]; conversation membership lives behind
//! [`ConversationDirectory`]. Every call into either trait is a suspension
//! point for the calling handler.

use crate::error::{SyncError, SyncResult};
use crate::types::{ConversationId, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Voice,
    Video,
}

/// Proof that `user_id` read a message. Append-only, one per (message, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Display state derived from the receipt list. Nothing is stored for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Seen,
}

/// A persisted message with its ordered receipt list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub read_by: Vec<ReadReceipt>,
}

impl Message {
    pub fn has_receipt_from(&self, user_id: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user_id)
    }

    /// Whether this message counts toward `user_id`'s unread counter.
    pub fn is_unread_for(&self, user_id: &UserId) -> bool {
        &self.sender_id != user_id && !self.has_receipt_from(user_id)
    }

    pub fn delivery_state(&self) -> DeliveryState {
        delivery_state(&self.sender_id, &self.read_by)
    }
}

/// `Seen` iff someone other than the sender has a receipt on the message.
pub fn delivery_state(sender_id: &UserId, receipts: &[ReadReceipt]) -> DeliveryState {
    if receipts.iter().any(|r| &r.user_id != sender_id) {
        DeliveryState::Seen
    } else {
        DeliveryState::Sent
    }
}

/// A receipt newly appended by [`MessageStore::append_receipts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedReceipt {
    pub message_id: MessageId,
    /// Sender of the message, i.e. the party whose "seen" indicator flips.
    pub sender_id: UserId,
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn text(
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            content: content.into(),
            kind: MessageKind::Text,
            reply_to: None,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.content.trim().is_empty() {
            return Err(SyncError::MalformedCommand("message content is empty".into()));
        }
        if self.content.chars().count() > MAX_CONTENT_CHARS {
            return Err(SyncError::MalformedCommand(format!(
                "message content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }
        Ok(())
    }
}

/// A membership snapshot of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
}

impl Conversation {
    pub fn includes(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }
}

/// Membership lists per conversation.
#[async_trait]
pub trait ConversationDirectory: Send + Sync + 'static {
    /// Every conversation `user_id` participates in.
    async fn conversations_of(&self, user_id: &UserId) -> SyncResult<Vec<Conversation>>;

    /// Participants of one conversation. Unknown conversations yield an empty list.
    async fn participants(&self, conversation_id: &ConversationId) -> SyncResult<Vec<UserId>>;

    async fn is_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SyncResult<bool> {
        Ok(self.participants(conversation_id).await?.contains(user_id))
    }
}

/// Durable message and receipt persistence.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persists a message. The sender's own receipt is stamped at `at`.
    async fn create_message(&self, message: NewMessage, at: DateTime<Utc>) -> SyncResult<Message>;

    /// Appends a receipt from `reader` to every message in the conversation
    /// that is unread for them, restricted to `only` when given (an empty
    /// list means no restriction). Returns the messages that received a new
    /// receipt; already-read messages are skipped.
    async fn append_receipts(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        only: Option<&[MessageId]>,
        at: DateTime<Utc>,
    ) -> SyncResult<Vec<AppendedReceipt>>;

    /// Count of messages in the conversation not sent by `user_id` and carrying
    /// no receipt from them.
    async fn unread_count(&self, conversation_id: &ConversationId, user_id: &UserId)
    -> SyncResult<u64>;

    /// The receipt list of one message, or `None` if it does not exist.
    async fn read_status(&self, message_id: &MessageId) -> SyncResult<Option<Vec<ReadReceipt>>>;
}

/// A process-local store implementing both collaborator contracts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Vec<UserId>>,
    messages: DashMap<ConversationId, Vec<Message>>,
    locations: DashMap<MessageId, ConversationId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a conversation's participant list.
    pub fn put_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
        participants: impl IntoIterator<Item = impl Into<UserId>>,
    ) {
        let mut members: Vec<UserId> = Vec::new();
        for p in participants {
            let p = p.into();
            if !members.contains(&p) {
                members.push(p);
            }
        }
        self.conversations.insert(conversation_id.into(), members);
    }

    pub fn add_participant(&self, conversation_id: &ConversationId, user_id: UserId) {
        let mut members = self.conversations.entry(conversation_id.clone()).or_default();
        if !members.contains(&user_id) {
            members.push(user_id);
        }
    }

    pub fn remove_participant(&self, conversation_id: &ConversationId, user_id: &UserId) {
        if let Some(mut members) = self.conversations.get_mut(conversation_id) {
            members.retain(|m| m != user_id);
        }
    }

    /// Snapshot of a conversation's history in creation order.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.messages
            .get(conversation_id)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationDirectory for MemoryStore {
    async fn conversations_of(&self, user_id: &UserId) -> SyncResult<Vec<Conversation>> {
        let mut found: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|e| Conversation {
                id: e.key().clone(),
                participants: e.value().clone(),
            })
            .filter(|c| c.includes(user_id))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn participants(&self, conversation_id: &ConversationId) -> SyncResult<Vec<UserId>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, message: NewMessage, at: DateTime<Utc>) -> SyncResult<Message> {
        message.validate()?;
        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(SyncError::Store(format!(
                "conversation {} does not exist",
                message.conversation_id
            )));
        }

        let stored = Message {
            id: MessageId::new(Uuid::new_v4().to_string()),
            conversation_id: message.conversation_id,
            read_by: vec![ReadReceipt {
                user_id: message.sender_id.clone(),
                read_at: at,
            }],
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content: message.content,
            kind: message.kind,
            reply_to: message.reply_to,
            created_at: at,
        };

        self.locations
            .insert(stored.id.clone(), stored.conversation_id.clone());
        self.messages
            .entry(stored.conversation_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn append_receipts(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        only: Option<&[MessageId]>,
        at: DateTime<Utc>,
    ) -> SyncResult<Vec<AppendedReceipt>> {
        let Some(mut history) = self.messages.get_mut(conversation_id) else {
            return Ok(Vec::new());
        };

        let only = only.filter(|ids| !ids.is_empty());
        let mut affected = Vec::new();
        for message in history.iter_mut() {
            if !message.is_unread_for(reader) {
                continue;
            }
            if let Some(ids) = only {
                if !ids.contains(&message.id) {
                    continue;
                }
            }
            message.read_by.push(ReadReceipt {
                user_id: reader.clone(),
                read_at: at,
            });
            affected.push(AppendedReceipt {
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
            });
        }
        Ok(affected)
    }

    async fn unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SyncResult<u64> {
        Ok(self
            .messages
            .get(conversation_id)
            .map(|history| history.iter().filter(|m| m.is_unread_for(user_id)).count() as u64)
            .unwrap_or(0))
    }

    async fn read_status(&self, message_id: &MessageId) -> SyncResult<Option<Vec<ReadReceipt>>> {
        let Some(conversation_id) = self.locations.get(message_id).map(|c| c.value().clone())
        else {
            return Ok(None);
        };
        Ok(self.messages.get(&conversation_id).and_then(|history| {
            history
                .iter()
                .find(|m| &m.id == message_id)
                .map(|m| m.read_by.clone())
        }))
    }
}
