//! Error taxonomy for the synchronization core.

use crate::types::ConversationId;
use thiserror::Error;

/// Errors surfaced by the core's components and collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The handshake credential was missing or invalid. No state is created.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The caller referenced a conversation it does not belong to.
    #[error("not a participant of conversation {conversation_id}")]
    NotAParticipant { conversation_id: ConversationId },

    /// A command was missing a required field or could not be decoded.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("message store error: {0}")]
    Store(String),

    #[error("conversation directory error: {0}")]
    Directory(String),

    #[error("connection registry error: {0}")]
    Registry(String),
}

impl SyncError {
    /// Stable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HandshakeRejected(_) => "unauthorized",
            Self::NotAParticipant { .. } => "not_a_participant",
            Self::MalformedCommand(_) => "malformed_command",
            Self::Store(_) | Self::Directory(_) | Self::Registry(_) => "internal",
        }
    }

    pub fn not_a_participant(conversation_id: &ConversationId) -> Self {
        Self::NotAParticipant {
            conversation_id: conversation_id.clone(),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for SyncError {
    fn from(value: redis::RedisError) -> Self {
        Self::Registry(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
