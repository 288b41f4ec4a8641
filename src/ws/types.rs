// chat-sync-kit/src/ws/types.rs

//! Connection-level types used by the registry, rooms and the `SyncService`.

use crate::events::ServerEvent;
use crate::types::UserId;
use axum::extract::ws::Utf8Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// A pre-serialized JSON text frame ready to be written to a socket.
pub type Frame = Utf8Bytes;

/// The sending half of a connection's outbound queue.
///
/// A dedicated writer task owns the socket sink and drains the receiving half,
/// so any component can push to a client without holding a lock on the socket.
pub type OutboundTx = mpsc::Sender<Frame>;

/// The receiving half of a connection's outbound queue.
pub type OutboundRx = mpsc::Receiver<Frame>;

/// One live bidirectional channel, owned by exactly one user.
///
/// Cloning a handle is cheap; all clones refer to the same outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    tx: OutboundTx,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh connection id and its outbound queue.
    pub fn open(user_id: UserId, buffer: usize) -> (Self, OutboundRx) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: ConnectionId::new_v4(),
            user_id,
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Queues an already serialized frame. Returns `false` when the queue is
    /// full or the writer task is gone; the frame is dropped in that case.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, user_id = %self.user_id, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %self.id, "Outbound queue closed, client likely disconnected");
                false
            }
        }
    }

    /// Serializes and queues a single event.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.deliver(frame),
            Err(e) => {
                warn!(conn_id = %self.id, "Failed to serialize event for client: {}", e);
                false
            }
        }
    }

    /// `true` once the receiving half (the writer task) is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}
