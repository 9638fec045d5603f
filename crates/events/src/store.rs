//! Notification store seam.
//!
//! The relational store is the system of record for a notification's
//! status. [`PgNotificationStore`] delegates to [`NotificationRepo`];
//! [`MemoryNotificationStore`] keeps rows in a map and enforces the same
//! transition rules, for single-process runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use fintrack_core::notification::NotificationStatus;
use fintrack_core::types::{DbId, Timestamp};
use fintrack_db::models::notification::{NewNotification, Notification};
use fintrack_db::repositories::NotificationRepo;
use fintrack_db::DbPool;
use sqlx::types::Json;

use crate::error::DeliveryResult;

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a row and return its id.
    async fn create(&self, input: &NewNotification) -> DeliveryResult<DbId>;

    async fn find(&self, id: DbId) -> DeliveryResult<Option<Notification>>;

    /// Apply a forward status transition.
    ///
    /// Returns `false` when the row is missing or its current status cannot
    /// move to `status`.
    async fn update_status(
        &self,
        id: DbId,
        status: NotificationStatus,
        read_at: Option<Timestamp>,
    ) -> DeliveryResult<bool>;

    /// Pending, unexpired rows for a user, oldest first.
    async fn list_pending(&self, user_id: DbId, limit: i64) -> DeliveryResult<Vec<Notification>>;

    /// Rows for a user, newest first.
    async fn list_for_user(
        &self,
        user_id: DbId,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> DeliveryResult<Vec<Notification>>;

    /// Client acknowledgement of one notification. A pending row is moved
    /// to delivered first, then to read.
    async fn mark_read(&self, id: DbId, user_id: DbId) -> DeliveryResult<bool>;

    async fn mark_all_read(&self, user_id: DbId) -> DeliveryResult<u64>;

    async fn unread_count(&self, user_id: DbId) -> DeliveryResult<i64>;

    /// Expire pending rows whose `expires_at` is at or before `now`.
    async fn expire_overdue(&self, now: Timestamp) -> DeliveryResult<u64>;

    async fn health_check(&self) -> DeliveryResult<()>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// Store backed by the `notifications` table.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: DbPool,
}

impl PgNotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, input: &NewNotification) -> DeliveryResult<DbId> {
        Ok(NotificationRepo::create(&self.pool, input).await?)
    }

    async fn find(&self, id: DbId) -> DeliveryResult<Option<Notification>> {
        Ok(NotificationRepo::find_by_id(&self.pool, id).await?)
    }

    async fn update_status(
        &self,
        id: DbId,
        status: NotificationStatus,
        read_at: Option<Timestamp>,
    ) -> DeliveryResult<bool> {
        Ok(NotificationRepo::transition(&self.pool, id, status, read_at).await?)
    }

    async fn list_pending(&self, user_id: DbId, limit: i64) -> DeliveryResult<Vec<Notification>> {
        Ok(NotificationRepo::list_pending_for_user(&self.pool, user_id, limit).await?)
    }

    async fn list_for_user(
        &self,
        user_id: DbId,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> DeliveryResult<Vec<Notification>> {
        Ok(NotificationRepo::list_for_user(&self.pool, user_id, status, limit, offset).await?)
    }

    async fn mark_read(&self, id: DbId, user_id: DbId) -> DeliveryResult<bool> {
        Ok(NotificationRepo::mark_read(&self.pool, id, user_id).await?)
    }

    async fn mark_all_read(&self, user_id: DbId) -> DeliveryResult<u64> {
        Ok(NotificationRepo::mark_all_read(&self.pool, user_id).await?)
    }

    async fn unread_count(&self, user_id: DbId) -> DeliveryResult<i64> {
        Ok(NotificationRepo::unread_count(&self.pool, user_id).await?)
    }

    async fn expire_overdue(&self, now: Timestamp) -> DeliveryResult<u64> {
        Ok(NotificationRepo::expire_overdue(&self.pool, now).await?)
    }

    async fn health_check(&self) -> DeliveryResult<()> {
        Ok(fintrack_db::health_check(&self.pool).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryRows {
    rows: BTreeMap<DbId, Notification>,
    next_id: DbId,
}

/// In-process store.
///
/// Counts every mutating call in [`write_count`](Self::write_count) so tests
/// can assert that a code path never touched the store.
#[derive(Default)]
pub struct MemoryNotificationStore {
    inner: Mutex<MemoryRows>,
    writes: AtomicUsize,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of create/update calls made so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRows> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn is_unread(row: &Notification) -> bool {
    matches!(
        row.status(),
        Ok(NotificationStatus::Pending | NotificationStatus::Delivered)
    )
}

/// Walk an unread row forward to `read`, one allowed step at a time.
fn acknowledge_row(row: &mut Notification, read_at: Timestamp) -> bool {
    let mut status = match row.status() {
        Ok(status) => status,
        Err(_) => return false,
    };
    if status == NotificationStatus::Pending {
        set_status(row, NotificationStatus::Delivered, None);
        status = NotificationStatus::Delivered;
    }
    if !status.can_transition_to(NotificationStatus::Read) {
        return false;
    }
    set_status(row, NotificationStatus::Read, Some(read_at));
    true
}

fn set_status(row: &mut Notification, status: NotificationStatus, read_at: Option<Timestamp>) {
    let now = Utc::now();
    row.status = status.as_str().to_string();
    if read_at.is_some() {
        row.read_at = read_at;
    }
    row.updated_at = now;
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, input: &NewNotification) -> DeliveryResult<DbId> {
        self.record_write();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.rows.insert(
            id,
            Notification {
                id,
                user_id: input.user_id,
                message: input.message.clone(),
                notification_type: input.notification_type.clone(),
                status: input.status.as_str().to_string(),
                meta: Json(input.meta.clone()),
                bus_key: input.bus_key.clone(),
                read_at: None,
                expires_at: input.expires_at,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn find(&self, id: DbId) -> DeliveryResult<Option<Notification>> {
        Ok(self.lock().rows.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: DbId,
        status: NotificationStatus,
        read_at: Option<Timestamp>,
    ) -> DeliveryResult<bool> {
        self.record_write();
        let mut inner = self.lock();
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(false);
        };
        if !row.status()?.can_transition_to(status) {
            return Ok(false);
        }
        set_status(row, status, read_at);
        Ok(true)
    }

    async fn list_pending(&self, user_id: DbId, limit: i64) -> DeliveryResult<Vec<Notification>> {
        let now = Utc::now();
        let limit = usize::try_from(limit).unwrap_or(0);
        // BTreeMap iteration is id order, which is creation order here.
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| row.user_id == user_id)
            .filter(|row| matches!(row.status(), Ok(NotificationStatus::Pending)))
            .filter(|row| row.expires_at.map_or(true, |at| at > now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_for_user(
        &self,
        user_id: DbId,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> DeliveryResult<Vec<Notification>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let offset = usize::try_from(offset).unwrap_or(0);
        Ok(self
            .lock()
            .rows
            .values()
            .rev()
            .filter(|row| row.user_id == user_id)
            .filter(|row| status.map_or(true, |s| row.status == s.as_str()))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, id: DbId, user_id: DbId) -> DeliveryResult<bool> {
        self.record_write();
        let mut inner = self.lock();
        match inner.rows.get_mut(&id) {
            Some(row) if row.user_id == user_id => Ok(acknowledge_row(row, Utc::now())),
            _ => Ok(false),
        }
    }

    async fn mark_all_read(&self, user_id: DbId) -> DeliveryResult<u64> {
        self.record_write();
        let now = Utc::now();
        let mut inner = self.lock();
        let mut updated = 0;
        for row in inner.rows.values_mut() {
            if row.user_id == user_id && acknowledge_row(row, now) {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn unread_count(&self, user_id: DbId) -> DeliveryResult<i64> {
        let count = self
            .lock()
            .rows
            .values()
            .filter(|row| row.user_id == user_id && is_unread(row))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn expire_overdue(&self, now: Timestamp) -> DeliveryResult<u64> {
        self.record_write();
        let mut inner = self.lock();
        let mut expired = 0;
        for row in inner.rows.values_mut() {
            let overdue = row.expires_at.is_some_and(|at| at <= now);
            if overdue && matches!(row.status(), Ok(NotificationStatus::Pending)) {
                set_status(row, NotificationStatus::Expired, None);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn health_check(&self) -> DeliveryResult<()> {
        Ok(())
    }
}
