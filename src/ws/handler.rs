// chat-sync-kit/src/ws/handler.rs

//! Per-connection command handling.
//!
//! Each inbound text frame is decoded into a [`ClientCommand`] and routed to
//! the owning component. A failing command is logged, answered with an
//! `error` event on the originating connection and otherwise ignored; the
//! connection stays open and no other state changes.

use crate::auth::VerifiedUser;
use crate::error::SyncError;
use crate::events::{ClientCommand, ServerEvent};
use crate::ws::service::SyncService;
use crate::ws::types::ConnectionHandle;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Everything a command handler knows about the connection it runs for.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub handle: ConnectionHandle,
    pub user: VerifiedUser,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("malformed command: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sync(e) => e.code(),
            Self::Decode(_) => "malformed_command",
        }
    }

    /// The `error` event sent back to the client. Internal failures are not
    /// described beyond their code.
    pub fn to_event(&self) -> ServerEvent {
        let code = self.code();
        let message = match code {
            "internal" => "internal error".to_owned(),
            _ => self.to_string(),
        };
        ServerEvent::error(code, message)
    }
}

impl SyncService {
    /// Decodes and routes one text frame. Never fails: errors go back to the
    /// sender as an `error` event.
    pub async fn handle_text(&self, context: &ConnectionContext, text: &str) {
        let result = match ClientCommand::parse(text) {
            Ok(command) => {
                debug!(?command, "Received command from client");
                self.handle_command(command, context).await
            }
            Err(e) => Err(HandlerError::from(e)),
        };

        if let Err(e) = result {
            warn!(
                conn_id = %context.handle.id(),
                user_id = %context.user.id,
                code = e.code(),
                "Command rejected: {}",
                e
            );
            context.handle.send_event(&e.to_event());
        }
    }

    #[instrument(skip_all, fields(conn_id = %context.handle.id(), user_id = %context.user.id, chat_id = %command.conversation_id()))]
    pub async fn handle_command(
        &self,
        command: ClientCommand,
        context: &ConnectionContext,
    ) -> Result<(), HandlerError> {
        let conversation_id = command.conversation_id().clone();
        let user_id = &context.user.id;

        // Leaving needs no membership: a non-member was never in the room.
        if let ClientCommand::Leave(_) = command {
            self.rooms().leave(context.handle.id(), &conversation_id);
            return Ok(());
        }

        if !self.directory().is_participant(&conversation_id, user_id).await? {
            return Err(SyncError::not_a_participant(&conversation_id).into());
        }

        match command {
            ClientCommand::TypingStart(_) => {
                self.typing().start(
                    &context.handle,
                    &conversation_id,
                    context.user.display_name.clone(),
                );
            }
            ClientCommand::TypingStop(_) => {
                self.typing().stop(&context.handle, &conversation_id);
            }
            ClientCommand::Join(_) => {
                self.rooms().join(context.handle.id(), conversation_id);
            }
            ClientCommand::MarkSeen(mark) => {
                self.receipts()
                    .mark_read(&conversation_id, user_id, mark.message_ids.as_deref())
                    .await?;
            }
            ClientCommand::Leave(_) => {}
        }
        Ok(())
    }
}
