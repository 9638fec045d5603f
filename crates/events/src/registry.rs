//! Process-local registry of live stream connections.
//!
//! [`ClientRegistry`] maps a user id to the sender half of that user's
//! output queue. Every register, unregister and lookup goes through one
//! mutex, so a publish can never observe a half-removed entry. The lock is
//! never held across an await point: all operations are a map access plus a
//! non-blocking send on an unbounded channel.
//!
//! A registration whose cancellation token has fired counts as absent even
//! before its transport drops it, so a publish racing a disconnect falls
//! through to the durable path.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fintrack_core::notification::NotificationContent;
use fintrack_core::types::{DbId, Timestamp};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sender half feeding a user's stream connection.
pub type OutboundSender = mpsc::UnboundedSender<NotificationContent>;

/// Receiver half drained by the stream transport.
pub type OutboundReceiver = mpsc::UnboundedReceiver<NotificationContent>;

/// Registry bookkeeping for one live connection.
struct ClientEntry {
    connection_id: Uuid,
    sender: OutboundSender,
    cancel: CancellationToken,
    connected_at: Timestamp,
}

impl ClientEntry {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }
}

/// Handle returned by [`ClientRegistry::register`].
///
/// The receiver is the only consumer of the user's output queue.
pub struct Registration {
    pub user_id: DbId,
    pub connection_id: Uuid,
    pub receiver: OutboundReceiver,
}

/// Thread-safe map from user id to that user's output queue.
pub struct ClientRegistry {
    clients: Mutex<HashMap<DbId, ClientEntry>>,
}

impl ClientRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DbId, ClientEntry>> {
        // A panic while holding the lock cannot leave the map half-written
        // (every mutation is a single insert/remove), so recover the guard.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace the output queue for `user_id`.
    ///
    /// Replacing drops the previous sender, which closes the previous
    /// connection's queue and ends its transport loop.
    pub fn register(&self, user_id: DbId) -> Registration {
        self.register_until(user_id, CancellationToken::new())
    }

    /// Like [`register`](Self::register), but the registration stops
    /// accepting payloads as soon as `cancel` fires.
    pub fn register_until(&self, user_id: DbId, cancel: CancellationToken) -> Registration {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        let entry = ClientEntry {
            connection_id,
            sender,
            cancel,
            connected_at: chrono::Utc::now(),
        };

        let replaced = self.lock().insert(user_id, entry);
        if let Some(previous) = replaced {
            tracing::debug!(
                user_id,
                previous_connection = %previous.connection_id,
                connection_id = %connection_id,
                "Replaced existing stream registration"
            );
        }

        Registration {
            user_id,
            connection_id,
            receiver,
        }
    }

    /// Close and remove the user's output queue.
    ///
    /// Returns `false` when no registration existed; calling it again is a
    /// no-op.
    pub fn unregister(&self, user_id: DbId) -> bool {
        self.lock().remove(&user_id).is_some()
    }

    /// Remove the user's registration only if it still belongs to
    /// `connection_id`.
    ///
    /// A transport that was replaced by a newer connection must not evict
    /// its successor when it shuts down.
    pub fn release(&self, user_id: DbId, connection_id: Uuid) -> bool {
        let mut clients = self.lock();
        match clients.get(&user_id) {
            Some(entry) if entry.connection_id == connection_id => {
                clients.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Push `content` onto the user's queue if they are connected to this
    /// process.
    ///
    /// Returns `false` when there is no registration, or when it was
    /// cancelled or its receiver has gone away; a stale entry is pruned.
    pub fn try_enqueue(&self, user_id: DbId, content: &NotificationContent) -> bool {
        let mut clients = self.lock();
        let Some(entry) = clients.get(&user_id) else {
            return false;
        };

        if entry.is_live() && entry.sender.send(content.clone()).is_ok() {
            return true;
        }

        tracing::debug!(
            user_id,
            connection_id = %entry.connection_id,
            "Pruning closed or cancelled registration"
        );
        clients.remove(&user_id);
        false
    }

    /// Whether the user currently has a live registration in this process.
    pub fn is_registered(&self, user_id: DbId) -> bool {
        self.lock().get(&user_id).is_some_and(ClientEntry::is_live)
    }

    /// When the user's current connection was registered.
    pub fn connected_since(&self, user_id: DbId) -> Option<Timestamp> {
        self.lock().get(&user_id).map(|entry| entry.connected_at)
    }

    /// Return the current number of registrations.
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every registration, ending all transport loops.
    ///
    /// Used during graceful shutdown. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut clients = self.lock();
        let count = clients.len();
        clients.clear();
        tracing::info!(count, "Closed all stream registrations");
        count
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
