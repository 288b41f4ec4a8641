//! The Connection Registry: which users are reachable right now.
//!
//! A user is online iff they hold at least one registered connection.
//! Callers depend only on the [`ConnectionRegistry`] trait; the in-memory
//! implementation serves a single node and [`RedisRegistry`] shares presence
//! across nodes.

use crate::error::SyncResult;
use crate::types::UserId;
use crate::ws::types::{ConnectionHandle, ConnectionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// Result of adding a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The user had no connection before this one.
    CameOnline,
    AlreadyOnline,
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistration {
    /// The last connection closed; `last_seen` was recorded.
    WentOffline { last_seen: DateTime<Utc> },
    StillOnline,
    /// The handle was not registered. Nothing changed.
    Unknown,
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync + 'static {
    async fn register(&self, handle: ConnectionHandle) -> SyncResult<Registration>;

    async fn unregister(
        &self,
        user_id: &UserId,
        conn_id: ConnectionId,
    ) -> SyncResult<Unregistration>;

    async fn is_online(&self, user_id: &UserId) -> SyncResult<bool>;

    /// Connections of `user_id` that this node can deliver to.
    fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionHandle>;

    async fn last_seen(&self, user_id: &UserId) -> SyncResult<Option<DateTime<Utc>>>;

    async fn online_users(&self) -> SyncResult<Vec<UserId>>;
}

/// Single-node registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    last_seen: DashMap<UserId, DateTime<Utc>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, handle: ConnectionHandle) -> Registration {
        let mut conns = self.users.entry(handle.user_id().clone()).or_default();
        let first = conns.is_empty();
        conns.insert(handle.id(), handle);
        if first {
            Registration::CameOnline
        } else {
            Registration::AlreadyOnline
        }
    }

    fn remove(&self, user_id: &UserId, conn_id: ConnectionId) -> Unregistration {
        let mut removed = false;
        // Removal and the emptiness check happen under the same shard lock.
        let emptied = self
            .users
            .remove_if_mut(user_id, |_, conns| {
                removed = conns.remove(&conn_id).is_some();
                conns.is_empty()
            })
            .is_some();

        match (removed, emptied) {
            (false, _) => Unregistration::Unknown,
            (true, false) => Unregistration::StillOnline,
            (true, true) => {
                let now = Utc::now();
                self.last_seen.insert(user_id.clone(), now);
                Unregistration::WentOffline { last_seen: now }
            }
        }
    }

    fn handles(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.users
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryRegistry {
    async fn register(&self, handle: ConnectionHandle) -> SyncResult<Registration> {
        debug!(conn_id = %handle.id(), user_id = %handle.user_id(), "Registering connection");
        Ok(self.add(handle))
    }

    async fn unregister(
        &self,
        user_id: &UserId,
        conn_id: ConnectionId,
    ) -> SyncResult<Unregistration> {
        debug!(%conn_id, %user_id, "Unregistering connection");
        Ok(self.remove(user_id, conn_id))
    }

    async fn is_online(&self, user_id: &UserId) -> SyncResult<bool> {
        Ok(self.users.get(user_id).is_some_and(|c| !c.is_empty()))
    }

    fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.handles(user_id)
    }

    async fn last_seen(&self, user_id: &UserId) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.last_seen.get(user_id).map(|t| *t.value()))
    }

    async fn online_users(&self) -> SyncResult<Vec<UserId>> {
        Ok(self
            .users
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_registry::RedisRegistry;

#[cfg(feature = "redis")]
mod redis_registry {
    use super::*;
    use redis::AsyncCommands;
    use redis::aio::MultiplexedConnection;
    use tracing::{info, instrument, warn};

    const ONLINE_KEY: &str = "chat-sync:online";

    fn presence_key(user_id: &UserId) -> String {
        format!("chat-sync:presence:{user_id}")
    }

    fn last_seen_key(user_id: &UserId) -> String {
        format!("chat-sync:last-seen:{user_id}")
    }

    /// Registry whose online/offline truth lives in Redis.
    ///
    /// Every connection on every node is a member `"{node_id}:{conn_id}"` of the
    /// user's presence set. Delivery handles stay local: `connections_of`
    /// returns only the connections held by this node.
    pub struct RedisRegistry {
        node_id: String,
        conn: MultiplexedConnection,
        local: InMemoryRegistry,
    }

    impl RedisRegistry {
        pub async fn connect(redis_url: &str, node_id: impl Into<String>) -> SyncResult<Self> {
            let client = redis::Client::open(redis_url)?;
            let conn = client.get_multiplexed_async_connection().await?;
            let node_id = node_id.into();
            info!(%node_id, "Redis presence registry connected");
            Ok(Self {
                node_id,
                conn,
                local: InMemoryRegistry::new(),
            })
        }

        fn member(&self, conn_id: ConnectionId) -> String {
            format!("{}:{}", self.node_id, conn_id)
        }

        /// Adds the connection to the user's shared presence set.
        async fn publish_member(
            &self,
            user_id: &UserId,
            conn_id: ConnectionId,
        ) -> SyncResult<Registration> {
            let key = presence_key(user_id);
            let mut conn = self.conn.clone();
            let (_, count): (i64, i64) = redis::pipe()
                .atomic()
                .sadd(&key, self.member(conn_id))
                .scard(&key)
                .query_async(&mut conn)
                .await?;

            if count == 1 {
                let _: i64 = conn.sadd(ONLINE_KEY, user_id.as_str()).await?;
                Ok(Registration::CameOnline)
            } else {
                Ok(Registration::AlreadyOnline)
            }
        }

        /// Best-effort removal of a member whose registration did not complete.
        async fn retract_member(&self, user_id: &UserId, conn_id: ConnectionId) {
            let mut conn = self.conn.clone();
            let removed: redis::RedisResult<i64> =
                conn.srem(presence_key(user_id), self.member(conn_id)).await;
            if let Err(e) = removed {
                warn!(%conn_id, "Failed to retract presence member: {}", e);
            }
        }
    }

    impl std::fmt::Debug for RedisRegistry {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisRegistry")
                .field("node_id", &self.node_id)
                .field("local", &self.local)
                .finish()
        }
    }

    #[async_trait]
    impl ConnectionRegistry for RedisRegistry {
        #[instrument(skip_all, fields(conn_id = %handle.id(), user_id = %handle.user_id()))]
        async fn register(&self, handle: ConnectionHandle) -> SyncResult<Registration> {
            let user_id = handle.user_id().clone();
            let conn_id = handle.id();
            self.local.add(handle);

            match self.publish_member(&user_id, conn_id).await {
                Ok(registration) => Ok(registration),
                Err(e) => {
                    warn!("Redis registration failed, dropping local handle: {}", e);
                    self.local.remove(&user_id, conn_id);
                    self.retract_member(&user_id, conn_id).await;
                    Err(e)
                }
            }
        }

        #[instrument(skip(self))]
        async fn unregister(
            &self,
            user_id: &UserId,
            conn_id: ConnectionId,
        ) -> SyncResult<Unregistration> {
            if self.local.remove(user_id, conn_id) == Unregistration::Unknown {
                return Ok(Unregistration::Unknown);
            }

            let key = presence_key(user_id);
            let mut conn = self.conn.clone();
            let (_, count): (i64, i64) = redis::pipe()
                .atomic()
                .srem(&key, self.member(conn_id))
                .scard(&key)
                .query_async(&mut conn)
                .await?;

            if count > 0 {
                return Ok(Unregistration::StillOnline);
            }

            let now = Utc::now();
            let _: () = redis::pipe()
                .atomic()
                .set(last_seen_key(user_id), now.to_rfc3339())
                .ignore()
                .srem(ONLINE_KEY, user_id.as_str())
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(Unregistration::WentOffline { last_seen: now })
        }

        async fn is_online(&self, user_id: &UserId) -> SyncResult<bool> {
            let mut conn = self.conn.clone();
            let count: i64 = conn.scard(presence_key(user_id)).await?;
            Ok(count > 0)
        }

        fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
            self.local.handles(user_id)
        }

        async fn last_seen(&self, user_id: &UserId) -> SyncResult<Option<DateTime<Utc>>> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(last_seen_key(user_id)).await?;
            Ok(raw.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!(%user_id, "Ignoring unparsable last-seen value: {}", e);
                    None
                }
            }))
        }

        async fn online_users(&self) -> SyncResult<Vec<UserId>> {
            let mut conn = self.conn.clone();
            let members: Vec<String> = conn.smembers(ONLINE_KEY).await?;
            Ok(members.into_iter().map(UserId::from).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(user: &str) -> ConnectionHandle {
        ConnectionHandle::open(UserId::from(user), 8).0
    }

    #[tokio::test]
    async fn user_stays_online_until_last_connection_closes() {
        let registry = InMemoryRegistry::new();
        let alice: UserId = "alice".into();
        let handles: Vec<_> = (0..3).map(|_| open("alice")).collect();

        let mut transitions = Vec::new();
        for h in &handles {
            transitions.push(registry.register(h.clone()).await.unwrap());
        }
        assert_eq!(
            transitions,
            vec![
                Registration::CameOnline,
                Registration::AlreadyOnline,
                Registration::AlreadyOnline
            ]
        );
        assert_eq!(registry.connections_of(&alice).len(), 3);

        for h in &handles[..2] {
            let t = registry.unregister(&alice, h.id()).await.unwrap();
            assert_eq!(t, Unregistration::StillOnline);
            assert!(registry.is_online(&alice).await.unwrap());
        }
        assert!(registry.last_seen(&alice).await.unwrap().is_none());

        let last = registry.unregister(&alice, handles[2].id()).await.unwrap();
        assert!(matches!(last, Unregistration::WentOffline { .. }));
        assert!(!registry.is_online(&alice).await.unwrap());
        assert!(registry.last_seen(&alice).await.unwrap().is_some());
        assert!(registry.online_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregistering_an_unknown_handle_is_a_no_op() {
        let registry = InMemoryRegistry::new();
        let alice = open("alice");
        registry.register(alice.clone()).await.unwrap();

        let stranger = open("alice");
        let t = registry
            .unregister(alice.user_id(), stranger.id())
            .await
            .unwrap();
        assert_eq!(t, Unregistration::Unknown);
        assert!(registry.is_online(alice.user_id()).await.unwrap());

        let nobody = registry
            .unregister(&"bob".into(), stranger.id())
            .await
            .unwrap();
        assert_eq!(nobody, Unregistration::Unknown);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn redis_registry_tracks_presence_across_handles() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let registry = RedisRegistry::connect(&url, uuid::Uuid::new_v4().to_string())
            .await
            .unwrap();
        let user = format!("user-{}", uuid::Uuid::new_v4());
        let a = open(&user);
        let b = open(&user);
        let uid = a.user_id().clone();

        assert_eq!(registry.register(a.clone()).await.unwrap(), Registration::CameOnline);
        assert_eq!(registry.register(b.clone()).await.unwrap(), Registration::AlreadyOnline);
        assert_eq!(
            registry.unregister(&uid, a.id()).await.unwrap(),
            Unregistration::StillOnline
        );
        assert!(matches!(
            registry.unregister(&uid, b.id()).await.unwrap(),
            Unregistration::WentOffline { .. }
        ));
        assert!(!registry.is_online(&uid).await.unwrap());
        assert!(registry.last_seen(&uid).await.unwrap().is_some());
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn redis_registry_drops_local_handle_when_registration_fails() {
        use redis::AsyncCommands;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let registry = RedisRegistry::connect(&url, uuid::Uuid::new_v4().to_string())
            .await
            .unwrap();
        let user = format!("user-{}", uuid::Uuid::new_v4());
        let key = format!("chat-sync:presence:{user}");

        // A string under the presence key makes SADD fail with WRONGTYPE.
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: () = conn.set(&key, "not-a-set").await.unwrap();

        let handle = open(&user);
        assert!(registry.register(handle.clone()).await.is_err());
        assert!(registry.connections_of(handle.user_id()).is_empty());

        let _: () = conn.del(&key).await.unwrap();
        assert!(!registry.is_online(handle.user_id()).await.unwrap());
    }
}
