//! The Message Fanout Dispatcher.
//!
//! Called once per persisted message. There is no per-conversation sequence
//! number: two senders dispatching at the same time may reach observers in
//! either order, and clients order by `createdAt`.

use crate::error::SyncResult;
use crate::events::{NewMessagePayload, ServerEvent};
use crate::receipts::UnreadPusher;
use crate::rooms::RoomMembership;
use crate::store::{ConversationDirectory, Message};
use std::sync::Arc;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanoutReport {
    /// Connections the `message:new` frame was queued for.
    pub delivered: usize,
    /// Participants that received a recomputed unread count.
    pub unread_pushes: usize,
}

pub struct MessageDispatcher {
    rooms: Arc<RoomMembership>,
    directory: Arc<dyn ConversationDirectory>,
    unread: UnreadPusher,
}

impl MessageDispatcher {
    pub fn new(
        rooms: Arc<RoomMembership>,
        directory: Arc<dyn ConversationDirectory>,
        unread: UnreadPusher,
    ) -> Self {
        Self {
            rooms,
            directory,
            unread,
        }
    }

    /// Pushes `message:new` to every connection joined to the room, then a
    /// fresh unread count to each other participant's connections.
    ///
    /// A failed unread recomputation for one participant is logged and does
    /// not stop the others.
    #[instrument(skip_all, fields(message_id = %message.id, chat_id = %message.conversation_id))]
    pub async fn dispatch(&self, message: &Message) -> SyncResult<FanoutReport> {
        let event = ServerEvent::MessageNew(NewMessagePayload::from(message));
        let delivered = self.rooms.emit_to_room(&message.conversation_id, &event, None);

        let participants = self.directory.participants(&message.conversation_id).await?;
        let mut unread_pushes = 0;
        for participant in participants.iter().filter(|p| **p != message.sender_id) {
            match self.unread.push(&message.conversation_id, participant).await {
                Ok(Some(_)) => unread_pushes += 1,
                Ok(None) => {}
                Err(e) => warn!(user_id = %participant, "Failed to push unread count: {}", e),
            }
        }

        Ok(FanoutReport {
            delivered,
            unread_pushes,
        })
    }
}
