//! # Chat Sync Kit
//!
//! The real-time synchronization core of a direct-messaging service, built on
//! Axum WebSockets. It keeps connected clients consistent with each other
//! while the durable state lives behind pluggable collaborators.
//!
//! ## Core Features
//!
//! - **Presence**: a user is online while they hold at least one connection;
//!   online/offline transitions are serialized per user and broadcast to
//!   everyone sharing a conversation with them.
//! - **Rooms & fan-out**: every connection auto-joins its user's conversations
//!   and receives `message:new` for each persisted message.
//! - **Typing signals**: timer-bound indicators that expire on their own.
//! - **Read receipts**: idempotent `markRead`, `message:seen` to the senders and
//!   unread counts recomputed from the store before every push.
//! - **Pluggable collaborators**: `ConversationDirectory`, `MessageStore` and
//!   `ConnectionRegistry` traits, with in-memory implementations and a Redis
//!   registry for multi-node presence.
//! - **Client side**: a typed `EventBus` and the `ChatState` reducer.
//!
//! ## Getting Started
//!
//! Build a [`ws::service::SyncService`], route `/ws` to
//! [`ws::upgrade::upgrade_handler`] and implement [`auth::TokenValidator`] on
//! the router state. `demos/dm_server.rs` wires a complete server.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod rooms;
pub mod store;
pub mod types;
pub mod typing;
pub mod ws;

/// Public prelude for convenience.
///
/// `use chat_sync_kit::prelude::*;`
pub mod prelude {
    pub use crate::auth::{TokenValidator, VerifiedUser, WsAuth};
    pub use crate::client::{ChatState, EventBus, Subscription};
    pub use crate::config::SyncConfig;
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::events::{ClientCommand, ServerEvent};
    pub use crate::registry::{ConnectionRegistry, InMemoryRegistry};
    pub use crate::store::{ConversationDirectory, MemoryStore, Message, MessageStore, NewMessage};
    pub use crate::types::{ConversationId, MessageId, UserId};
    pub use crate::ws::{
        handler::ConnectionContext, service::SyncService, types::ConnectionHandle,
        upgrade::upgrade_handler,
    };

    #[cfg(feature = "jwt")]
    pub use crate::auth::JwtValidator;

    #[cfg(feature = "redis")]
    pub use crate::registry::RedisRegistry;
}
