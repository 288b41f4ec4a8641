//! The Typing Signal Coordinator.
//!
//! Typing state is ephemeral and keyed by (conversation, user). Each entry
//! owns a single expiry timer; a refreshing `start` re-arms it without
//! emitting a duplicate `isTyping=true`. Expiry and explicit `stop` emit the
//! same `isTyping=false` update.

use crate::events::{ServerEvent, TypingUpdate};
use crate::rooms::RoomMembership;
use crate::types::{ConversationId, UserId};
use crate::ws::types::{ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

type TypingKey = (ConversationId, UserId);

struct TypingState {
    user_name: Option<String>,
    /// The connection that sent the last `start`; it never hears its own echo.
    origin: ConnectionId,
    epoch: u64,
    timer: JoinHandle<()>,
}

pub struct TypingCoordinator {
    rooms: Arc<RoomMembership>,
    ttl: Duration,
    states: Arc<DashMap<TypingKey, TypingState>>,
    epochs: AtomicU64,
}

impl fmt::Debug for TypingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypingCoordinator")
            .field("ttl", &self.ttl)
            .field("active", &self.states.len())
            .finish()
    }
}

impl TypingCoordinator {
    pub fn new(rooms: Arc<RoomMembership>, ttl: Duration) -> Self {
        Self {
            rooms,
            ttl,
            states: Arc::new(DashMap::new()),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.states
            .contains_key(&(conversation_id.clone(), user_id.clone()))
    }

    /// Marks the user as typing and (re-)arms the expiry timer. Returns `true`
    /// when an `isTyping=true` update was broadcast, `false` for a refresh.
    #[instrument(skip_all, fields(conn_id = %origin.id(), user_id = %origin.user_id(), chat_id = %conversation_id))]
    pub fn start(
        &self,
        origin: &ConnectionHandle,
        conversation_id: &ConversationId,
        user_name: Option<String>,
    ) -> bool {
        let key = (conversation_id.clone(), origin.user_id().clone());
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let timer = self.arm(key.clone(), epoch);

        let announce = match self.states.entry(key) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.timer.abort();
                state.timer = timer;
                state.epoch = epoch;
                state.origin = origin.id();
                if user_name.is_some() {
                    state.user_name = user_name.clone();
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(TypingState {
                    user_name: user_name.clone(),
                    origin: origin.id(),
                    epoch,
                    timer,
                });
                true
            }
        };

        if announce {
            let event = typing_event(conversation_id, origin.user_id(), user_name, true);
            self.rooms.emit_to_room(conversation_id, &event, Some(origin.id()));
        } else {
            debug!("Typing refreshed, timer re-armed");
        }
        announce
    }

    /// Cancels any pending timer and broadcasts `isTyping=false` immediately.
    #[instrument(skip_all, fields(conn_id = %origin.id(), user_id = %origin.user_id(), chat_id = %conversation_id))]
    pub fn stop(&self, origin: &ConnectionHandle, conversation_id: &ConversationId) {
        let key = (conversation_id.clone(), origin.user_id().clone());
        let user_name = self.states.remove(&key).and_then(|(_, state)| {
            state.timer.abort();
            state.user_name
        });
        let event = typing_event(conversation_id, origin.user_id(), user_name, false);
        self.rooms.emit_to_room(conversation_id, &event, Some(origin.id()));
    }

    /// Drops the typing states last started from `origin` in the given
    /// conversations and broadcasts the stop. States refreshed from another
    /// device of the same user are left to expire on their own.
    pub fn clear_for(&self, origin: &ConnectionHandle, conversations: &[ConversationId]) -> usize {
        let mut cleared = 0;
        for conversation_id in conversations {
            let key = (conversation_id.clone(), origin.user_id().clone());
            let Some((_, state)) = self.states.remove_if(&key, |_, s| s.origin == origin.id())
            else {
                continue;
            };
            state.timer.abort();
            let event = typing_event(conversation_id, origin.user_id(), state.user_name, false);
            self.rooms.emit_to_room(conversation_id, &event, Some(origin.id()));
            cleared += 1;
        }
        cleared
    }

    fn arm(&self, key: TypingKey, epoch: u64) -> JoinHandle<()> {
        let states = Arc::clone(&self.states);
        let rooms = Arc::clone(&self.rooms);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            // A newer start re-armed the entry if the epoch moved on.
            let Some((_, state)) = states.remove_if(&key, |_, s| s.epoch == epoch) else {
                return;
            };
            let (conversation_id, user_id) = key;
            debug!(%conversation_id, %user_id, "Typing expired");
            let event = typing_event(&conversation_id, &user_id, state.user_name, false);
            rooms.emit_to_room(&conversation_id, &event, Some(state.origin));
        })
    }
}

fn typing_event(
    conversation_id: &ConversationId,
    user_id: &UserId,
    user_name: Option<String>,
    is_typing: bool,
) -> ServerEvent {
    ServerEvent::TypingUpdate(TypingUpdate {
        chat_id: conversation_id.clone(),
        user_id: user_id.clone(),
        user_name,
        is_typing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::OutboundRx;

    const TTL: Duration = Duration::from_secs(3);

    struct Fixture {
        typing: TypingCoordinator,
        alice: ConnectionHandle,
        alice_rx: OutboundRx,
        bob_rx: OutboundRx,
    }

    fn fixture() -> Fixture {
        let rooms = Arc::new(RoomMembership::new());
        let (alice, alice_rx) = ConnectionHandle::open("alice".into(), 16);
        let (bob, bob_rx) = ConnectionHandle::open("bob".into(), 16);
        for h in [&alice, &bob] {
            rooms.attach(h.clone());
            rooms.join(h.id(), "c1".into());
        }
        Fixture {
            typing: TypingCoordinator::new(rooms, TTL),
            alice,
            alice_rx,
            bob_rx,
        }
    }

    fn updates(rx: &mut OutboundRx) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Ok(ServerEvent::TypingUpdate(u)) = serde_json::from_str(frame.as_str()) {
                seen.push(u.is_typing);
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_exactly_the_ttl() {
        let mut f = fixture();
        let c1: ConversationId = "c1".into();
        assert_eq!(f.typing.ttl(), TTL);
        assert!(f.typing.start(&f.alice, &c1, Some("Alice".into())));
        assert_eq!(updates(&mut f.bob_rx), vec![true]);

        tokio::time::sleep(f.typing.ttl() - Duration::from_millis(1)).await;
        assert!(updates(&mut f.bob_rx).is_empty());
        assert!(f.typing.is_typing(&c1, f.alice.user_id()));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(updates(&mut f.bob_rx), vec![false]);
        assert!(!f.typing.is_typing(&c1, f.alice.user_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rearms_without_duplicate_true() {
        let mut f = fixture();
        let c1: ConversationId = "c1".into();
        f.typing.start(&f.alice, &c1, None);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.typing.start(&f.alice, &c1, None));

        // The original deadline passes without an expiry.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(updates(&mut f.bob_rx), vec![true]);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(updates(&mut f.bob_rx), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_timer() {
        let mut f = fixture();
        let c1: ConversationId = "c1".into();
        f.typing.start(&f.alice, &c1, None);
        f.typing.stop(&f.alice, &c1);
        assert_eq!(updates(&mut f.bob_rx), vec![true, false]);

        tokio::time::sleep(TTL * 2).await;
        assert!(updates(&mut f.bob_rx).is_empty());

        // A start after a stop announces again.
        assert!(f.typing.start(&f.alice, &c1, None));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_only_touches_states_from_that_connection() {
        let mut f = fixture();
        let c1: ConversationId = "c1".into();
        let (other_device, _rx) = ConnectionHandle::open("alice".into(), 16);

        f.typing.start(&f.alice, &c1, None);
        assert_eq!(f.typing.clear_for(&other_device, &[c1.clone()]), 0);
        assert!(f.typing.is_typing(&c1, f.alice.user_id()));

        assert_eq!(f.typing.clear_for(&f.alice, &[c1.clone()]), 1);
        assert_eq!(updates(&mut f.bob_rx), vec![true, false]);
        tokio::time::sleep(TTL * 2).await;
        assert!(updates(&mut f.bob_rx).is_empty());
    }

    #[tokio::test]
    async fn sender_connection_does_not_hear_itself() {
        let mut f = fixture();
        f.typing.start(&f.alice, &"c1".into(), None);
        assert!(f.alice_rx.try_recv().is_err());
    }
}
