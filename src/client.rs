//! Client-side consumption of server events.
//!
//! [`EventBus`] is a typed publish/subscribe surface: every `on_*` call
//! registers one callback and returns a [`Subscription`] that removes exactly
//! that callback when disposed or dropped. [`ChatState`] is a reducer that
//! folds server events into the state a chat UI renders.

use crate::events::{
    ErrorPayload, EventKind, MessageSeenUpdate, NewMessagePayload, PresenceStatus, ReadBy,
    ServerEvent, TypingUpdate, UnreadCountUpdate, UserStatusUpdate,
};
use crate::store::{DeliveryState, ReadReceipt, delivery_state};
use crate::types::{ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

type Listener = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    by_kind: DashMap<EventKind, Vec<(u64, Listener)>>,
}

/// Routes incoming server events to the callbacks subscribed to their name.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Listeners>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.inner.by_kind.iter().map(|e| e.value().len()).sum();
        f.debug_struct("EventBus").field("listeners", &total).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            listeners: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    pub fn on_user_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UserStatusUpdate) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::UserStatus, move |event| {
            if let ServerEvent::UserStatus(update) = event {
                callback(update)
            }
        })
    }

    pub fn on_typing_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TypingUpdate) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::TypingUpdate, move |event| {
            if let ServerEvent::TypingUpdate(update) = event {
                callback(update)
            }
        })
    }

    pub fn on_new_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NewMessagePayload) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::MessageNew, move |event| {
            if let ServerEvent::MessageNew(message) = event {
                callback(message)
            }
        })
    }

    pub fn on_message_seen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MessageSeenUpdate) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::MessageSeen, move |event| {
            if let ServerEvent::MessageSeen(update) = event {
                callback(update)
            }
        })
    }

    pub fn on_unread_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UnreadCountUpdate) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::UnreadUpdate, move |event| {
            if let ServerEvent::UnreadUpdate(update) = event {
                callback(update)
            }
        })
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ErrorPayload) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Error, move |event| {
            if let ServerEvent::Error(error) = event {
                callback(error)
            }
        })
    }

    /// Calls every subscriber of the event's name, in subscription order.
    /// Returns the number of callbacks invoked.
    ///
    /// Callbacks run outside the internal lock, so they may subscribe or
    /// dispose freely.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let listeners: Vec<Listener> = match self.inner.by_kind.get(&event.kind()) {
            Some(entry) => entry.value().iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => Vec::new(),
        };
        for listener in &listeners {
            listener(event);
        }
        debug!(event = event.name(), listeners = listeners.len(), "Dispatched event");
        listeners.len()
    }

    /// Decodes one text frame and dispatches it.
    pub fn dispatch_frame(&self, text: &str) -> Result<usize, serde_json::Error> {
        let event: ServerEvent = serde_json::from_str(text)?;
        Ok(self.dispatch(&event))
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.by_kind.get(&kind).map_or(0, |e| e.value().len())
    }
}

/// Disposer for one callback registered on an [`EventBus`].
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    listeners: Weak<Listeners>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Removes the callback. Equivalent to dropping the subscription.
    pub fn dispose(self) {}

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        listeners
            .by_kind
            .remove_if_mut(&self.kind, |_, subscribed| {
                subscribed.retain(|(id, _)| *id != self.id);
                subscribed.is_empty()
            });
    }
}

/// Presence as last reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A message held by the client together with the receipts it has learned of.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadMessage {
    pub message: NewMessagePayload,
    pub read_by: Vec<ReadReceipt>,
}

impl ThreadMessage {
    pub fn delivery_state(&self) -> DeliveryState {
        delivery_state(&self.message.sender_id, &self.read_by)
    }

    fn add_reader(&mut self, read_by: &ReadBy) -> bool {
        if self.read_by.iter().any(|r| r.user_id == read_by.user_id) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user_id: read_by.user_id.clone(),
            read_at: read_by.read_at,
        });
        true
    }
}

/// Chat state folded from server events.
///
/// Typing indicators are cleared only by the server's `isTyping=false`
/// updates; the reducer keeps no timer of its own.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    presence: HashMap<UserId, PeerPresence>,
    /// Per chat, typists in the order they started.
    typing: HashMap<ConversationId, Vec<(UserId, Option<String>)>>,
    /// Only non-zero counts are kept.
    unread: HashMap<ConversationId, u64>,
    /// Per chat, ordered by `createdAt`.
    messages: HashMap<ConversationId, Vec<ThreadMessage>>,
    last_error: Option<ErrorPayload>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::UserStatus(update) => {
                self.presence.insert(
                    update.user_id.clone(),
                    PeerPresence {
                        status: update.status,
                        last_seen: update.last_seen,
                    },
                );
            }
            ServerEvent::TypingUpdate(update) => self.apply_typing(update),
            ServerEvent::MessageNew(message) => self.insert_message(message.clone(), Vec::new()),
            ServerEvent::MessageSeen(update) => {
                if let Some(thread) = self.messages.get_mut(&update.chat_id) {
                    for held in thread
                        .iter_mut()
                        .filter(|m| update.message_ids.contains(&m.message.id))
                    {
                        held.add_reader(&update.read_by);
                    }
                }
            }
            ServerEvent::UnreadUpdate(update) => {
                if update.unread_count > 0 {
                    self.unread.insert(update.chat_id.clone(), update.unread_count);
                } else {
                    self.unread.remove(&update.chat_id);
                }
            }
            ServerEvent::Error(error) => self.last_error = Some(error.clone()),
        }
    }

    fn apply_typing(&mut self, update: &TypingUpdate) {
        if update.is_typing {
            let typists = self.typing.entry(update.chat_id.clone()).or_default();
            match typists.iter_mut().find(|(id, _)| *id == update.user_id) {
                Some((_, name)) => {
                    if update.user_name.is_some() {
                        name.clone_from(&update.user_name);
                    }
                }
                None => typists.push((update.user_id.clone(), update.user_name.clone())),
            }
        } else if let Some(typists) = self.typing.get_mut(&update.chat_id) {
            typists.retain(|(id, _)| *id != update.user_id);
            if typists.is_empty() {
                self.typing.remove(&update.chat_id);
            }
        }
    }

    /// Adds a message (e.g. loaded from history) unless one with the same id
    /// is already held.
    pub fn insert_message(&mut self, message: NewMessagePayload, read_by: Vec<ReadReceipt>) {
        let thread = self.messages.entry(message.chat_id.clone()).or_default();
        if thread.iter().any(|m| m.message.id == message.id) {
            return;
        }
        let at = thread.partition_point(|m| m.message.created_at <= message.created_at);
        thread.insert(at, ThreadMessage { message, read_by });
    }

    pub fn presence_of(&self, user_id: &UserId) -> Option<&PeerPresence> {
        self.presence.get(user_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.presence
            .get(user_id)
            .is_some_and(|p| p.status == PresenceStatus::Online)
    }

    pub fn unread_count(&self, chat_id: &ConversationId) -> u64 {
        self.unread.get(chat_id).copied().unwrap_or(0)
    }

    pub fn unread_chats(&self) -> &HashMap<ConversationId, u64> {
        &self.unread
    }

    pub fn is_typing(&self, chat_id: &ConversationId, user_id: &UserId) -> bool {
        self.typing
            .get(chat_id)
            .is_some_and(|t| t.iter().any(|(id, _)| id == user_id))
    }

    /// "Ann is typing...", "Ann, Bob are typing..." or `None`. Typists with
    /// no known name show as "Someone".
    pub fn typing_summary(&self, chat_id: &ConversationId) -> Option<String> {
        let typists = self.typing.get(chat_id).filter(|t| !t.is_empty())?;
        let names: Vec<&str> = typists
            .iter()
            .map(|(_, name)| name.as_deref().unwrap_or("Someone"))
            .collect();
        Some(match names.as_slice() {
            [one] => format!("{one} is typing..."),
            many => format!("{} are typing...", many.join(", ")),
        })
    }

    pub fn messages(&self, chat_id: &ConversationId) -> &[ThreadMessage] {
        self.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn message(&self, chat_id: &ConversationId, id: &MessageId) -> Option<&ThreadMessage> {
        self.messages(chat_id).iter().find(|m| &m.message.id == id)
    }

    pub fn last_error(&self) -> Option<&ErrorPayload> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageKind;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn unread(chat: &str, count: u64) -> ServerEvent {
        ServerEvent::UnreadUpdate(UnreadCountUpdate {
            chat_id: chat.into(),
            unread_count: count,
        })
    }

    fn typing(user: &str, name: Option<&str>, is_typing: bool) -> ServerEvent {
        ServerEvent::TypingUpdate(TypingUpdate {
            chat_id: "c1".into(),
            user_id: user.into(),
            user_name: name.map(str::to_owned),
            is_typing,
        })
    }

    fn message(id: &str, sender: &str, minute: u32) -> NewMessagePayload {
        NewMessagePayload {
            id: id.into(),
            chat_id: "c1".into(),
            sender_id: sender.into(),
            sender_name: None,
            content: format!("message {id}"),
            kind: MessageKind::Text,
            reply_to: None,
            created_at: DateTime::parse_from_rfc3339(&format!("2024-05-01T10:{minute:02}:00Z"))
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn each_subscriber_is_removed_independently() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        let sub_a = bus.on_unread_update(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        let _sub_b = bus.on_unread_update(move |u| {
            s.fetch_add(u.unread_count as usize, Ordering::SeqCst);
        });

        assert_eq!(bus.dispatch(&unread("c1", 2)), 2);
        sub_a.dispose();
        assert_eq!(bus.dispatch(&unread("c1", 3)), 1);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 5);
        assert_eq!(bus.listener_count(EventKind::UnreadUpdate), 1);
    }

    #[test]
    fn dispatch_only_reaches_matching_event_name() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let _sub = bus.on_typing_update(move |u| log.lock().unwrap().push(u.is_typing));

        assert_eq!(bus.dispatch(&unread("c1", 1)), 0);
        let frame = typing("bob", None, true).to_frame().unwrap();
        assert_eq!(bus.dispatch_frame(frame.as_str()).unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn dropping_the_subscription_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.on_new_message(|_| {});
            assert_eq!(bus.listener_count(EventKind::MessageNew), 1);
        }
        assert_eq!(bus.listener_count(EventKind::MessageNew), 0);
    }

    #[test]
    fn unread_map_drops_zero_counts() {
        let mut state = ChatState::new();
        state.apply(&unread("c1", 2));
        assert_eq!(state.unread_count(&"c1".into()), 2);
        state.apply(&unread("c1", 0));
        assert!(state.unread_chats().is_empty());
    }

    #[test]
    fn typing_summary_lists_typists_in_order() {
        let mut state = ChatState::new();
        let c1: ConversationId = "c1".into();
        assert_eq!(state.typing_summary(&c1), None);

        state.apply(&typing("ann", Some("Ann"), true));
        assert_eq!(state.typing_summary(&c1).as_deref(), Some("Ann is typing..."));

        state.apply(&typing("bob", Some("Bob"), true));
        state.apply(&typing("ann", Some("Ann"), true));
        assert_eq!(
            state.typing_summary(&c1).as_deref(),
            Some("Ann, Bob are typing...")
        );

        state.apply(&typing("ann", None, false));
        state.apply(&typing("zed", None, true));
        assert_eq!(
            state.typing_summary(&c1).as_deref(),
            Some("Bob, Someone are typing...")
        );
    }

    #[test]
    fn seen_update_merges_without_duplicate_readers() {
        let mut state = ChatState::new();
        let c1: ConversationId = "c1".into();
        state.apply(&ServerEvent::MessageNew(message("m2", "alice", 5)));
        state.apply(&ServerEvent::MessageNew(message("m1", "alice", 1)));
        state.apply(&ServerEvent::MessageNew(message("m1", "alice", 1)));
        let ids: Vec<&str> = state
            .messages(&c1)
            .iter()
            .map(|m| m.message.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let seen = ServerEvent::MessageSeen(MessageSeenUpdate {
            chat_id: c1.clone(),
            read_by: ReadBy {
                user_id: "bob".into(),
                read_at: Utc::now(),
            },
            message_ids: vec!["m1".into()],
        });
        state.apply(&seen);
        state.apply(&seen);

        let m1 = state.message(&c1, &"m1".into()).unwrap();
        assert_eq!(m1.read_by.len(), 1);
        assert_eq!(m1.delivery_state(), DeliveryState::Seen);
        let m2 = state.message(&c1, &"m2".into()).unwrap();
        assert_eq!(m2.delivery_state(), DeliveryState::Sent);
    }

    #[test]
    fn presence_keeps_last_seen() {
        let mut state = ChatState::new();
        let at = Utc::now();
        state.apply(&ServerEvent::UserStatus(UserStatusUpdate {
            user_id: "bob".into(),
            status: PresenceStatus::Offline,
            last_seen: Some(at),
        }));
        let bob: UserId = "bob".into();
        assert!(!state.is_online(&bob));
        assert_eq!(state.presence_of(&bob).unwrap().last_seen, Some(at));
    }
}
