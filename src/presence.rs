//! The Presence Broadcaster.
//!
//! Online/offline transitions of one user are strictly ordered: register or
//! unregister, the emptiness check and the resulting `user:status` broadcast
//! all run while holding that user's transition gate. The gate is a FIFO
//! `tokio::sync::Mutex`, so a quick disconnect/reconnect can never publish
//! "online" before the preceding "offline" has gone out.
//!
//! Delivery is best-effort: peers that are offline at the moment of the
//! transition receive nothing and reconcile on their next connect.

use crate::error::SyncResult;
use crate::events::{PresenceStatus, ServerEvent, UserStatusUpdate};
use crate::registry::{ConnectionRegistry, Registration, Unregistration};
use crate::rooms::deliver_all;
use crate::store::ConversationDirectory;
use crate::types::UserId;
use crate::ws::types::{ConnectionHandle, ConnectionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub struct PresenceBroadcaster {
    registry: Arc<dyn ConnectionRegistry>,
    directory: Arc<dyn ConversationDirectory>,
    gates: DashMap<UserId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for PresenceBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceBroadcaster")
            .field("pending_gates", &self.gates.len())
            .finish()
    }
}

impl PresenceBroadcaster {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        Self {
            registry,
            directory,
            gates: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    /// Registers the handle and, on the user's first connection, announces
    /// them as online.
    ///
    /// If the announcement fails the handle is unregistered again before the
    /// error is returned, so a refused connection never counts as online.
    #[instrument(skip_all, fields(conn_id = %handle.id(), user_id = %handle.user_id()))]
    pub async fn connect(&self, handle: ConnectionHandle) -> SyncResult<Registration> {
        let user_id = handle.user_id().clone();
        let conn_id = handle.id();
        self.exclusive(&user_id, async {
            let registration = self.registry.register(handle).await?;
            if registration == Registration::CameOnline {
                info!("User came online");
                if let Err(e) = self.broadcast(&user_id, PresenceStatus::Online, None).await {
                    warn!("Online broadcast failed, rolling back registration: {}", e);
                    if let Err(undo) = self.registry.unregister(&user_id, conn_id).await {
                        error!("Failed to roll back registration: {}", undo);
                    }
                    return Err(e);
                }
            }
            Ok(registration)
        })
        .await
    }

    /// Unregisters the connection and, if it was the user's last one,
    /// announces them as offline with their `last_seen` time.
    #[instrument(skip(self))]
    pub async fn disconnect(
        &self,
        user_id: &UserId,
        conn_id: ConnectionId,
    ) -> SyncResult<Unregistration> {
        self.exclusive(user_id, async {
            let unregistration = self.registry.unregister(user_id, conn_id).await?;
            if let Unregistration::WentOffline { last_seen } = unregistration {
                info!("User went offline");
                self.broadcast(user_id, PresenceStatus::Offline, Some(last_seen))
                    .await?;
            }
            Ok(unregistration)
        })
        .await
    }

    /// Peers sharing at least one conversation with `user_id`, excluding them.
    pub async fn interested_peers(&self, user_id: &UserId) -> SyncResult<BTreeSet<UserId>> {
        let conversations = self.directory.conversations_of(user_id).await?;
        Ok(conversations
            .into_iter()
            .flat_map(|c| c.participants)
            .filter(|p| p != user_id)
            .collect())
    }

    /// Emits `user:status` to every online interested peer. Returns the
    /// number of connections reached.
    async fn broadcast(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> SyncResult<usize> {
        let peers = self.interested_peers(user_id).await?;
        let event = ServerEvent::UserStatus(UserStatusUpdate {
            user_id: user_id.clone(),
            status,
            last_seen,
        });

        let mut delivered = 0;
        for peer in &peers {
            if !self.registry.is_online(peer).await? {
                continue;
            }
            delivered += deliver_all(self.registry.connections_of(peer), &event);
        }
        debug!(%user_id, ?status, peers = peers.len(), delivered, "Broadcast user status");
        Ok(delivered)
    }

    /// Runs `transition` while holding the user's gate, then drops the gate
    /// if nobody else is queued on it.
    async fn exclusive<T>(&self, user_id: &UserId, transition: impl Future<Output = T>) -> T {
        let gate = Arc::clone(self.gates.entry(user_id.clone()).or_default().value());
        let output = {
            let _turn = gate.lock().await;
            transition.await
        };
        drop(gate);
        self.gates
            .remove_if(user_id, |_, gate| Arc::strong_count(gate) == 1);
        output
    }
}
