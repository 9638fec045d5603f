//! Per-user offline queue.
//!
//! Each user owns one hash keyed `<offline_prefix><user_id>`. Fields are
//! notification ids (or a generated UUID for ephemeral payloads) and values
//! are the JSON [`NotificationContent`]. Every write renews the TTL of the
//! whole hash; a user who never reconnects within the TTL loses the queue.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fintrack_core::channels::offline_key;
use fintrack_core::notification::NotificationContent;
use fintrack_core::types::DbId;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::DeliveryResult;

/// Durable per-user holding area for notifications nobody received live.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Upsert `content` into the user's hash and renew its TTL.
    async fn store(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()>;

    /// Fetch and delete every entry for the user in one atomic step.
    ///
    /// Entries come back ordered by notification id; payloads that fail to
    /// decode are logged and dropped.
    async fn drain(&self, user_id: DbId) -> DeliveryResult<Vec<NotificationContent>>;

    /// Delete a single entry. Returns `true` if it existed.
    async fn remove(&self, user_id: DbId, notification_id: DbId) -> DeliveryResult<bool>;

    /// Number of entries currently queued for the user.
    async fn len(&self, user_id: DbId) -> DeliveryResult<usize>;
}

/// Hash field under which `content` is stored.
fn entry_field(content: &NotificationContent) -> String {
    match content.notification_id {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

/// Decode drained `(field, payload)` pairs, oldest store id first.
///
/// Ephemeral entries (UUID fields) sort after persisted ones.
fn decode_entries(user_id: DbId, entries: Vec<(String, String)>) -> Vec<NotificationContent> {
    let mut decoded: Vec<(Option<DbId>, NotificationContent)> = entries
        .into_iter()
        .filter_map(|(field, raw)| match NotificationContent::from_wire(&raw) {
            Ok(content) => Some((field.parse().ok(), content)),
            Err(e) => {
                tracing::warn!(user_id, %field, error = %e, "Dropping malformed offline entry");
                None
            }
        })
        .collect();

    decoded.sort_by_key(|(id, _)| (id.is_none(), id.unwrap_or_default()));
    decoded.into_iter().map(|(_, content)| content).collect()
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Offline queue stored in Redis hashes.
pub struct RedisOfflineQueue {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl RedisOfflineQueue {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        ttl: Duration,
    ) -> DeliveryResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, key_prefix, ttl))
    }

    /// Build on an existing connection manager.
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    fn key(&self, user_id: DbId) -> String {
        offline_key(&self.key_prefix, user_id)
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}

#[async_trait]
impl OfflineQueue for RedisOfflineQueue {
    async fn store(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()> {
        let key = self.key(user_id);
        let field = entry_field(content);
        let payload = content.to_wire()?;
        let mut conn = self.conn.clone();

        let (): () = redis::pipe()
            .atomic()
            .hset(&key, &field, payload)
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(user_id, %key, %field, "Stored notification in offline queue");
        Ok(())
    }

    async fn drain(&self, user_id: DbId) -> DeliveryResult<Vec<NotificationContent>> {
        let key = self.key(user_id);
        let mut conn = self.conn.clone();

        let (entries,): (HashMap<String, String>,) = redis::pipe()
            .atomic()
            .hgetall(&key)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(decode_entries(user_id, entries.into_iter().collect()))
    }

    async fn remove(&self, user_id: DbId, notification_id: DbId) -> DeliveryResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(self.key(user_id), notification_id.to_string())
            .await?;
        Ok(removed > 0)
    }

    async fn len(&self, user_id: DbId) -> DeliveryResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(self.key(user_id)).await?;
        Ok(len)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct UserHash {
    /// `(field, payload)` in first-write order.
    entries: Vec<(String, String)>,
    expires_at: Instant,
}

/// In-process offline queue with the same TTL semantics as Redis.
pub struct MemoryOfflineQueue {
    hashes: Mutex<HashMap<DbId, UserHash>>,
    ttl: Duration,
}

impl MemoryOfflineQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            hashes: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Run `f` on the user's hash after discarding it if it has expired.
    fn with_live_hash<R>(&self, user_id: DbId, f: impl FnOnce(Option<&mut UserHash>) -> R) -> R {
        let mut hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        if hashes
            .get(&user_id)
            .is_some_and(|hash| hash.expires_at <= Instant::now())
        {
            hashes.remove(&user_id);
        }
        f(hashes.get_mut(&user_id))
    }
}

#[async_trait]
impl OfflineQueue for MemoryOfflineQueue {
    async fn store(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()> {
        let field = entry_field(content);
        let payload = content.to_wire()?;
        let expires_at = Instant::now() + self.ttl;

        let mut hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        let hash = hashes.entry(user_id).or_insert_with(|| UserHash {
            entries: Vec::new(),
            expires_at,
        });
        if hash.expires_at <= Instant::now() {
            hash.entries.clear();
        }
        hash.expires_at = expires_at;

        match hash.entries.iter_mut().find(|(existing, _)| *existing == field) {
            Some(entry) => entry.1 = payload,
            None => hash.entries.push((field, payload)),
        }
        Ok(())
    }

    async fn drain(&self, user_id: DbId) -> DeliveryResult<Vec<NotificationContent>> {
        let entries = {
            let mut hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
            match hashes.remove(&user_id) {
                Some(hash) if hash.expires_at > Instant::now() => hash.entries,
                _ => Vec::new(),
            }
        };
        Ok(decode_entries(user_id, entries))
    }

    async fn remove(&self, user_id: DbId, notification_id: DbId) -> DeliveryResult<bool> {
        let field = notification_id.to_string();
        Ok(self.with_live_hash(user_id, |hash| {
            let Some(hash) = hash else {
                return false;
            };
            let before = hash.entries.len();
            hash.entries.retain(|(existing, _)| *existing != field);
            hash.entries.len() < before
        }))
    }

    async fn len(&self, user_id: DbId) -> DeliveryResult<usize> {
        Ok(self.with_live_hash(user_id, |hash| hash.map_or(0, |h| h.entries.len())))
    }
}
