//! The `SyncService`: owns every component and drives connection lifecycles.

use crate::auth::VerifiedUser;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::ServerEvent;
use crate::fanout::MessageDispatcher;
use crate::presence::PresenceBroadcaster;
use crate::receipts::{MarkReadOutcome, ReadReceiptEngine, UnreadPusher};
use crate::registry::{ConnectionRegistry, InMemoryRegistry};
use crate::rooms::{RoomMembership, deliver_all};
use crate::store::{ConversationDirectory, MemoryStore, Message, MessageStore, NewMessage};
use crate::typing::TypingCoordinator;
use crate::types::{ConversationId, MessageId, UserId};
use crate::ws::handler::ConnectionContext;
use crate::ws::types::{ConnectionHandle, ConnectionId, OutboundRx};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{
    SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// The synchronization core of one serving process.
///
/// Build it once, share it as `Arc<SyncService>` and hand every upgraded
/// socket to [`SyncService::handle_connection`].
pub struct SyncService {
    config: SyncConfig,
    registry: Arc<dyn ConnectionRegistry>,
    directory: Arc<dyn ConversationDirectory>,
    store: Arc<dyn MessageStore>,
    rooms: Arc<RoomMembership>,
    presence: PresenceBroadcaster,
    typing: TypingCoordinator,
    receipts: ReadReceiptEngine,
    dispatcher: MessageDispatcher,
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("config", &self.config)
            .field("rooms", &self.rooms)
            .field("presence", &self.presence)
            .field("typing", &self.typing)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        registry: Arc<dyn ConnectionRegistry>,
        directory: Arc<dyn ConversationDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<Self> {
        let rooms = Arc::new(RoomMembership::new());
        let unread = UnreadPusher::new(Arc::clone(&registry), Arc::clone(&store));
        Arc::new(Self {
            presence: PresenceBroadcaster::new(Arc::clone(&registry), Arc::clone(&directory)),
            typing: TypingCoordinator::new(Arc::clone(&rooms), config.typing_timeout),
            receipts: ReadReceiptEngine::new(Arc::clone(&rooms), Arc::clone(&store), unread.clone()),
            dispatcher: MessageDispatcher::new(Arc::clone(&rooms), Arc::clone(&directory), unread),
            config,
            registry,
            directory,
            store,
            rooms,
        })
    }

    /// A single-node service over an in-memory registry, with `store` acting
    /// as both directory and message store.
    pub fn in_memory(config: SyncConfig, store: Arc<MemoryStore>) -> Arc<Self> {
        let directory: Arc<dyn ConversationDirectory> = store.clone();
        Self::new(config, Arc::new(InMemoryRegistry::new()), directory, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn directory(&self) -> &Arc<dyn ConversationDirectory> {
        &self.directory
    }

    pub(crate) fn rooms(&self) -> &RoomMembership {
        &self.rooms
    }

    pub(crate) fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub(crate) fn receipts(&self) -> &ReadReceiptEngine {
        &self.receipts
    }

    /// Opens a connection for `user`: registers it (announcing presence on
    /// the first one) and joins it to every conversation the user belongs to.
    ///
    /// The returned receiver yields the frames queued for this connection.
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn connect(&self, user: &VerifiedUser) -> SyncResult<(ConnectionHandle, OutboundRx)> {
        let (handle, rx) = ConnectionHandle::open(user.id.clone(), self.config.outbound_buffer);
        self.presence.connect(handle.clone()).await?;
        self.rooms.attach(handle.clone());

        if let Err(e) = self.rooms.auto_join(&handle, self.directory.as_ref()).await {
            error!(conn_id = %handle.id(), "Auto-join failed, dropping connection: {}", e);
            self.disconnect(&handle).await;
            return Err(e);
        }
        Ok((handle, rx))
    }

    /// Tears a connection down: clears typing it started, leaves its rooms,
    /// then unregisters it (announcing offline after the last one).
    #[instrument(skip_all, fields(conn_id = %handle.id(), user_id = %handle.user_id()))]
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let joined = self.rooms.rooms_of(handle.id());
        self.typing.clear_for(handle, &joined);
        self.rooms.detach(handle.id());

        if let Err(e) = self.presence.disconnect(handle.user_id(), handle.id()).await {
            error!("Failed to unregister connection: {}", e);
        }
    }

    /// Persists a message from `sender` and fans it out exactly once.
    ///
    /// The sender fields are taken from the verified identity, not from the
    /// payload. Fan-out failures are logged; the persisted message is still
    /// returned.
    #[instrument(skip_all, fields(user_id = %sender.id, chat_id = %message.conversation_id))]
    pub async fn send_message(
        &self,
        sender: &VerifiedUser,
        mut message: NewMessage,
    ) -> SyncResult<Message> {
        message.sender_id = sender.id.clone();
        if message.sender_name.is_none() {
            message.sender_name = sender.display_name.clone();
        }
        message.validate()?;
        self.ensure_participant(&message.conversation_id, &sender.id)
            .await?;

        let created = self.store.create_message(message, Utc::now()).await?;
        match self.dispatcher.dispatch(&created).await {
            Ok(report) => debug!(
                message_id = %created.id,
                delivered = report.delivered,
                unread_pushes = report.unread_pushes,
                "Message fanned out"
            ),
            Err(e) => warn!(message_id = %created.id, "Message fan-out failed: {}", e),
        }
        Ok(created)
    }

    /// Marks messages of a conversation as read by `reader`. `None` (or an
    /// empty list) marks everything unread.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        message_ids: Option<&[MessageId]>,
    ) -> SyncResult<MarkReadOutcome> {
        self.ensure_participant(conversation_id, reader).await?;
        self.receipts
            .mark_read(conversation_id, reader, message_ids)
            .await
    }

    /// Queues `event` on every local connection of `user_id`.
    pub fn emit_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        deliver_all(self.registry.connections_of(user_id), event)
    }

    pub fn emit_to_room(
        &self,
        conversation_id: &ConversationId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        self.rooms.emit_to_room(conversation_id, event, except)
    }

    pub async fn is_online(&self, user_id: &UserId) -> SyncResult<bool> {
        self.registry.is_online(user_id).await
    }

    pub async fn online_users(&self) -> SyncResult<Vec<UserId>> {
        self.registry.online_users().await
    }

    pub async fn last_seen(&self, user_id: &UserId) -> SyncResult<Option<DateTime<Utc>>> {
        self.registry.last_seen(user_id).await
    }

    /// Number of connections currently joined to the conversation's room.
    pub fn room_size(&self, conversation_id: &ConversationId) -> usize {
        self.rooms.room_size(conversation_id)
    }

    async fn ensure_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SyncResult<()> {
        if self.directory.is_participant(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(SyncError::not_a_participant(conversation_id))
        }
    }

    /// Entry point for an upgraded socket. Returns when the client goes away.
    #[instrument(skip_all, fields(conn_id, user_id = %user.id))]
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, user: VerifiedUser) {
        let (handle, rx) = match self.connect(&user).await {
            Ok(opened) => opened,
            Err(e) => {
                error!("Failed to open connection: {}", e);
                return;
            }
        };
        tracing::Span::current().record("conn_id", tracing::field::display(handle.id()));

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(run_writer(sink, rx));
        let context = ConnectionContext { handle, user };

        info!("Client connected.");
        self.run_client_message_receiver(stream, &context).await;

        info!("Client disconnected. Cleaning up...");
        self.disconnect(&context.handle).await;
        writer.abort();
    }

    /// Processes one connection's frames in arrival order.
    async fn run_client_message_receiver(
        &self,
        mut stream: SplitStream<WebSocket>,
        context: &ConnectionContext,
    ) {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                WsMessage::Text(text) => self.handle_text(context, text.as_str()).await,
                WsMessage::Close(_) => {
                    debug!("Received close frame from client.");
                    break;
                }
                _ => {}
            }
        }
    }
}

/// Drains a connection's outbound queue into its socket.
async fn run_writer(mut sink: SplitSink<WebSocket, WsMessage>, mut rx: OutboundRx) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(WsMessage::Text(frame)).await {
            warn!("Failed to send frame, client likely disconnected: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}
