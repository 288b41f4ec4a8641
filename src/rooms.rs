//! Room Membership: which connections currently receive a conversation's events.
//!
//! A room is the set of *joined connections* for one conversation, not its
//! persisted participant list. A participant with no joined connection is
//! simply outside the fan-out scope; nothing is queued for them.

use crate::error::SyncResult;
use crate::events::ServerEvent;
use crate::store::ConversationDirectory;
use crate::types::ConversationId;
use crate::ws::types::{ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
pub struct RoomMembership {
    /// Every attached connection, for delivery by id.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Conversation → joined connections. Empty rooms are removed.
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
    /// Connection → joined conversations, for cleanup on disconnect.
    joined: DashMap<ConnectionId, HashSet<ConversationId>>,
}

impl fmt::Debug for RoomMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomMembership")
            .field("connections_count", &self.connections.len())
            .field("rooms_count", &self.rooms.len())
            .finish()
    }
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a registered connection eligible to join rooms.
    pub fn attach(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.id(), handle);
    }

    /// Removes a connection from every room it joined. Returns those rooms.
    pub fn detach(&self, conn_id: ConnectionId) -> Vec<ConversationId> {
        self.connections.remove(&conn_id);
        let rooms: Vec<ConversationId> = self
            .joined
            .remove(&conn_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            self.remove_from_room(room, conn_id);
        }
        rooms
    }

    /// Joins the connection to one room per conversation its user belongs to.
    /// The directory is consulted once; later membership changes need an
    /// explicit `join`/`leave`.
    #[instrument(skip_all, fields(conn_id = %handle.id(), user_id = %handle.user_id()))]
    pub async fn auto_join<D>(&self, handle: &ConnectionHandle, directory: &D) -> SyncResult<usize>
    where
        D: ConversationDirectory + ?Sized,
    {
        let conversations = directory.conversations_of(handle.user_id()).await?;
        let mut count = 0;
        for conversation in conversations {
            if self.join(handle.id(), conversation.id) {
                count += 1;
            }
        }
        info!(rooms = count, "Auto-joined conversation rooms");
        Ok(count)
    }

    /// Returns `false` if the connection is not attached.
    pub fn join(&self, conn_id: ConnectionId, conversation_id: ConversationId) -> bool {
        if !self.connections.contains_key(&conn_id) {
            warn!(%conn_id, %conversation_id, "Join from a detached connection ignored");
            return false;
        }
        self.rooms
            .entry(conversation_id.clone())
            .or_default()
            .insert(conn_id);
        self.joined
            .entry(conn_id)
            .or_default()
            .insert(conversation_id.clone());
        // A concurrent `detach` may have run between the check and the inserts.
        if !self.connections.contains_key(&conn_id) {
            self.joined.remove(&conn_id);
            self.remove_from_room(&conversation_id, conn_id);
            warn!(%conn_id, %conversation_id, "Connection detached while joining");
            return false;
        }
        debug!(%conn_id, %conversation_id, size = self.room_size(&conversation_id), "Connection joined room");
        true
    }

    /// Returns `false` if the connection was not in the room.
    pub fn leave(&self, conn_id: ConnectionId, conversation_id: &ConversationId) -> bool {
        let was_joined = self
            .joined
            .get_mut(&conn_id)
            .is_some_and(|mut set| set.remove(conversation_id));
        if was_joined {
            self.remove_from_room(conversation_id, conn_id);
            debug!(%conn_id, %conversation_id, "Connection left room");
        }
        was_joined
    }

    fn remove_from_room(&self, conversation_id: &ConversationId, conn_id: ConnectionId) {
        self.rooms.remove_if_mut(conversation_id, |_, members| {
            members.remove(&conn_id);
            members.is_empty()
        });
    }

    pub fn is_joined(&self, conn_id: ConnectionId, conversation_id: &ConversationId) -> bool {
        self.rooms
            .get(conversation_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub fn room_size(&self, conversation_id: &ConversationId) -> usize {
        self.rooms.get(conversation_id).map_or(0, |m| m.len())
    }

    pub fn rooms_of(&self, conn_id: ConnectionId) -> Vec<ConversationId> {
        self.joined
            .get(&conn_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handles of every connection currently joined to the room.
    pub fn room_connections(&self, conversation_id: &ConversationId) -> Vec<ConnectionHandle> {
        let ids: Vec<ConnectionId> = match self.rooms.get(conversation_id) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|h| h.value().clone()))
            .collect()
    }

    /// Fans an event out to the room, optionally skipping one connection.
    /// Returns the number of connections the frame was queued for.
    pub fn emit_to_room(
        &self,
        conversation_id: &ConversationId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let targets = self
            .room_connections(conversation_id)
            .into_iter()
            .filter(|h| Some(h.id()) != except);
        let delivered = deliver_all(targets, event);
        debug!(%conversation_id, event = event.name(), delivered, "Emitted to room");
        delivered
    }
}

/// Serializes `event` once and queues it on every handle.
pub fn deliver_all<I>(handles: I, event: &ServerEvent) -> usize
where
    I: IntoIterator<Item = ConnectionHandle>,
{
    let frame = match event.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(event = event.name(), "Failed to serialize event: {}", e);
            return 0;
        }
    };
    handles
        .into_iter()
        .filter(|h| h.deliver(frame.clone()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UnreadCountUpdate;
    use crate::store::MemoryStore;
    use crate::types::UserId;
    use crate::ws::types::OutboundRx;

    fn open(user: &str) -> (ConnectionHandle, OutboundRx) {
        ConnectionHandle::open(UserId::from(user), 8)
    }

    fn ping(chat: &str) -> ServerEvent {
        ServerEvent::UnreadUpdate(UnreadCountUpdate {
            chat_id: chat.into(),
            unread_count: 0,
        })
    }

    #[tokio::test]
    async fn auto_join_uses_directory_snapshot() {
        let store = MemoryStore::new();
        store.put_conversation("c1", ["alice", "bob"]);
        store.put_conversation("c2", ["alice", "carol"]);
        store.put_conversation("c3", ["bob", "carol"]);

        let rooms = RoomMembership::new();
        let (alice, _rx) = open("alice");
        rooms.attach(alice.clone());
        assert_eq!(rooms.auto_join(&alice, &store).await.unwrap(), 2);

        let mut joined = rooms.rooms_of(alice.id());
        joined.sort();
        assert_eq!(joined, vec![ConversationId::from("c1"), ConversationId::from("c2")]);

        // Directory changes after connect are not picked up automatically.
        store.put_conversation("c3", ["alice", "bob", "carol"]);
        assert!(!rooms.is_joined(alice.id(), &"c3".into()));
    }

    #[tokio::test]
    async fn emit_skips_excluded_connection_and_non_members() {
        let rooms = RoomMembership::new();
        let (a, mut a_rx) = open("alice");
        let (b, mut b_rx) = open("bob");
        let (c, mut c_rx) = open("carol");
        for h in [&a, &b, &c] {
            rooms.attach(h.clone());
        }
        rooms.join(a.id(), "c1".into());
        rooms.join(b.id(), "c1".into());

        let delivered = rooms.emit_to_room(&"c1".into(), &ping("c1"), Some(a.id()));
        assert_eq!(delivered, 1);
        assert!(b_rx.try_recv().is_ok());
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn leave_and_detach_clean_up_empty_rooms() {
        let rooms = RoomMembership::new();
        let (a, _a_rx) = open("alice");
        rooms.attach(a.clone());
        rooms.join(a.id(), "c1".into());
        rooms.join(a.id(), "c2".into());

        assert!(rooms.leave(a.id(), &"c1".into()));
        assert!(!rooms.leave(a.id(), &"c1".into()));
        assert_eq!(rooms.room_size(&"c1".into()), 0);

        assert_eq!(rooms.detach(a.id()), vec![ConversationId::from("c2")]);
        assert_eq!(rooms.room_size(&"c2".into()), 0);
        assert!(!rooms.join(a.id(), "c1".into()));
    }

    #[test]
    fn join_racing_detach_leaves_no_orphans() {
        let rooms = RoomMembership::new();
        for _ in 0..200 {
            let (a, _rx) = open("alice");
            rooms.attach(a.clone());
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for chat in ["c1", "c2", "c3", "c4"] {
                        rooms.join(a.id(), chat.into());
                    }
                });
                scope.spawn(|| {
                    rooms.detach(a.id());
                });
            });
            assert!(rooms.rooms_of(a.id()).is_empty());
            assert!(rooms.joined.is_empty());
            assert!(rooms.rooms.is_empty());
        }
    }
}
