//! The Read-Receipt & Unread-Counter Engine.
//!
//! Unread counts are never stored or incremented locally. Every push is the
//! result of a fresh `MessageStore::unread_count` query made right before the
//! push, so the value a client sees equals the derived count at that instant.

use crate::error::SyncResult;
use crate::events::{MessageSeenUpdate, ReadBy, ServerEvent, UnreadCountUpdate};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomMembership, deliver_all};
use crate::store::MessageStore;
use crate::types::{ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Recomputes a user's unread count and pushes it to all of their connections.
#[derive(Clone)]
pub struct UnreadPusher {
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
}

impl UnreadPusher {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }

    /// Returns the pushed count, or `None` when the user has no connection on
    /// this node (the store is not queried in that case).
    pub async fn push(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SyncResult<Option<u64>> {
        let connections = self.registry.connections_of(user_id);
        if connections.is_empty() {
            return Ok(None);
        }
        let unread_count = self.store.unread_count(conversation_id, user_id).await?;
        let event = ServerEvent::UnreadUpdate(UnreadCountUpdate {
            chat_id: conversation_id.clone(),
            unread_count,
        });
        // Connections opened during the query still get the fresh value.
        let delivered = deliver_all(self.registry.connections_of(user_id), &event);
        debug!(%conversation_id, %user_id, unread_count, delivered, "Pushed unread count");
        Ok(Some(unread_count))
    }
}

/// What a `mark_read` call changed.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkReadOutcome {
    /// Messages that received a new receipt. Empty for a no-op.
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
    /// The unread count pushed to the reader, if anything changed and the
    /// reader is connected.
    pub unread_count: Option<u64>,
}

impl MarkReadOutcome {
    pub fn is_noop(&self) -> bool {
        self.message_ids.is_empty()
    }
}

pub struct ReadReceiptEngine {
    rooms: Arc<RoomMembership>,
    store: Arc<dyn MessageStore>,
    unread: UnreadPusher,
}

impl ReadReceiptEngine {
    pub fn new(rooms: Arc<RoomMembership>, store: Arc<dyn MessageStore>, unread: UnreadPusher) -> Self {
        Self { rooms, store, unread }
    }

    /// Appends `reader`'s receipts and publishes the consequences:
    ///
    /// 1. one `message:seen` to the room connections of the affected messages'
    ///    senders, listing every newly read id;
    /// 2. a recomputed `chat:unreadUpdate` to every connection of the reader.
    ///
    /// Re-reading already-read messages appends nothing and publishes nothing.
    #[instrument(skip(self, message_ids), fields(requested = ?message_ids.map(|ids| ids.len())))]
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        message_ids: Option<&[MessageId]>,
    ) -> SyncResult<MarkReadOutcome> {
        let read_at = Utc::now();
        let appended = self
            .store
            .append_receipts(conversation_id, reader, message_ids, read_at)
            .await?;

        if appended.is_empty() {
            debug!("Nothing new to mark as read");
            return Ok(MarkReadOutcome {
                message_ids: Vec::new(),
                read_at,
                unread_count: None,
            });
        }

        let senders: HashSet<&UserId> = appended.iter().map(|r| &r.sender_id).collect();
        let ids: Vec<MessageId> = appended.iter().map(|r| r.message_id.clone()).collect();
        let event = ServerEvent::MessageSeen(MessageSeenUpdate {
            chat_id: conversation_id.clone(),
            read_by: ReadBy {
                user_id: reader.clone(),
                read_at,
            },
            message_ids: ids.clone(),
        });
        let targets = self
            .rooms
            .room_connections(conversation_id)
            .into_iter()
            .filter(|h| senders.contains(h.user_id()));
        let delivered = deliver_all(targets, &event);
        debug!(marked = ids.len(), delivered, "Broadcast message:seen");

        let unread_count = self.unread.push(conversation_id, reader).await?;
        Ok(MarkReadOutcome {
            message_ids: ids,
            read_at,
            unread_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::store::{MemoryStore, NewMessage};
    use crate::ws::types::{ConnectionHandle, OutboundRx};

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: ReadReceiptEngine,
        alice_rx: OutboundRx,
        bob_rx: OutboundRx,
        bob2_rx: OutboundRx,
        carol_rx: OutboundRx,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put_conversation("c1", ["alice", "bob", "carol"]);
        let registry = Arc::new(InMemoryRegistry::new());
        let rooms = Arc::new(RoomMembership::new());

        let mut receivers = Vec::new();
        for user in ["alice", "bob", "bob", "carol"] {
            let (handle, rx) = ConnectionHandle::open(user.into(), 16);
            registry.register(handle.clone()).await.unwrap();
            rooms.attach(handle.clone());
            rooms.join(handle.id(), "c1".into());
            receivers.push(rx);
        }
        let carol_rx = receivers.pop().unwrap();
        let bob2_rx = receivers.pop().unwrap();
        let bob_rx = receivers.pop().unwrap();
        let alice_rx = receivers.pop().unwrap();

        let unread = UnreadPusher::new(registry.clone(), store.clone());
        let engine = ReadReceiptEngine::new(rooms, store.clone(), unread);
        Fixture {
            store,
            engine,
            alice_rx,
            bob_rx,
            bob2_rx,
            carol_rx,
        }
    }

    fn drain(rx: &mut OutboundRx) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn seen_goes_to_sender_and_count_to_every_reader_device() {
        let mut f = fixture().await;
        let msg = f
            .store
            .create_message(NewMessage::text("c1", "alice", "hello"), Utc::now())
            .await
            .unwrap();

        let outcome = f
            .engine
            .mark_read(&"c1".into(), &"bob".into(), Some(&[msg.id.clone()][..]))
            .await
            .unwrap();
        assert_eq!(outcome.message_ids, vec![msg.id.clone()]);
        assert_eq!(outcome.unread_count, Some(0));

        let alice_events = drain(&mut f.alice_rx);
        assert_eq!(alice_events.len(), 1);
        match &alice_events[0] {
            ServerEvent::MessageSeen(seen) => {
                assert_eq!(seen.read_by.user_id, UserId::from("bob"));
                assert_eq!(seen.message_ids, vec![msg.id.clone()]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        for rx in [&mut f.bob_rx, &mut f.bob2_rx] {
            let events = drain(rx);
            assert_eq!(
                events,
                vec![ServerEvent::UnreadUpdate(UnreadCountUpdate {
                    chat_id: "c1".into(),
                    unread_count: 0,
                })]
            );
        }
        assert!(drain(&mut f.carol_rx).is_empty());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let mut f = fixture().await;
        let msg = f
            .store
            .create_message(NewMessage::text("c1", "alice", "hello"), Utc::now())
            .await
            .unwrap();
        let c1: ConversationId = "c1".into();
        let bob: UserId = "bob".into();
        let ids = [msg.id.clone()];

        f.engine.mark_read(&c1, &bob, Some(&ids[..])).await.unwrap();
        let second = f.engine.mark_read(&c1, &bob, Some(&ids[..])).await.unwrap();
        assert!(second.is_noop());

        let receipts = f.store.read_status(&msg.id).await.unwrap().unwrap();
        assert_eq!(receipts.iter().filter(|r| r.user_id == bob).count(), 1);
        assert_eq!(drain(&mut f.alice_rx).len(), 1);
        assert_eq!(drain(&mut f.bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn pushed_count_matches_independent_derivation() {
        let mut f = fixture().await;
        let c1: ConversationId = "c1".into();
        let bob: UserId = "bob".into();
        let mut ids = Vec::new();
        for (sender, text) in [("alice", "a"), ("carol", "b"), ("alice", "c"), ("bob", "d")] {
            let m = f
                .store
                .create_message(NewMessage::text("c1", sender, text), Utc::now())
                .await
                .unwrap();
            ids.push(m.id);
        }

        let outcome = f.engine.mark_read(&c1, &bob, Some(&ids[..1])).await.unwrap();
        let derived = f
            .store
            .messages(&c1)
            .iter()
            .filter(|m| m.sender_id != bob && !m.read_by.iter().any(|r| r.user_id == bob))
            .count() as u64;
        assert_eq!(outcome.unread_count, Some(derived));
        assert_eq!(derived, 2);

        // carol sent none of the newly read messages.
        assert!(drain(&mut f.carol_rx).is_empty());

        let rest = f.engine.mark_read(&c1, &bob, None).await.unwrap();
        assert_eq!(rest.message_ids.len(), 2);
        assert_eq!(rest.unread_count, Some(0));
        assert_eq!(drain(&mut f.carol_rx).len(), 1);
    }
}
