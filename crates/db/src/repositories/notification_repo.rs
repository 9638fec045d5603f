//! Repository for the `notifications` table.

use fintrack_core::notification::NotificationStatus;
use fintrack_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::notification::{NewNotification, Notification};

/// Column list for `notifications` queries.
const COLUMNS: &str = "id, user_id, message, notification_type, status, meta, bus_key, \
                       read_at, expires_at, created_at, updated_at";

/// Provides CRUD and status transitions for notifications.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Insert a notification, returning the generated ID.
    pub async fn create(pool: &PgPool, input: &NewNotification) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO notifications \
                 (user_id, message, notification_type, status, meta, bus_key, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id",
        )
        .bind(input.user_id)
        .bind(&input.message)
        .bind(&input.notification_type)
        .bind(input.status.as_str())
        .bind(Json(&input.meta))
        .bind(input.bus_key.as_deref())
        .bind(input.expires_at)
        .fetch_one(pool)
        .await
    }

    /// Find a notification by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Notification>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Move a notification to `target`, but only from a status the state
    /// machine allows.
    ///
    /// `read_at` is written when provided and left untouched otherwise.
    /// Returns `false` when the row does not exist or is not in an allowed
    /// source status.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        target: NotificationStatus,
        read_at: Option<Timestamp>,
    ) -> Result<bool, sqlx::Error> {
        let sources: Vec<String> = NotificationStatus::allowed_sources(target)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            "UPDATE notifications \
             SET status = $2, read_at = COALESCE($3, read_at), updated_at = NOW() \
             WHERE id = $1 AND status = ANY($4)",
        )
        .bind(id)
        .bind(target.as_str())
        .bind(read_at)
        .bind(&sources)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pending, unexpired notifications for a user, oldest first.
    pub async fn list_pending_for_user(
        pool: &PgPool,
        user_id: DbId,
        limit: i64,
    ) -> Result<Vec<Notification>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE user_id = $1 AND status = 'pending' \
               AND (expires_at IS NULL OR expires_at > NOW()) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// List notifications for a user, newest first, optionally filtered by status.
    pub async fn list_for_user(
        pool: &PgPool,
        user_id: DbId,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(user_id)
            .bind(status.map(NotificationStatus::as_str))
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Record a client acknowledgement.
    ///
    /// An ack of a still-pending row is proof of delivery, so the row first
    /// moves to `delivered` and then to `read`, both in one transaction.
    /// Returns `true` if the notification belonged to the user and was
    /// updated.
    pub async fn mark_read(
        pool: &PgPool,
        notification_id: DbId,
        user_id: DbId,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "UPDATE notifications \
             SET status = 'delivered', updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND status = 'pending'",
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE notifications \
             SET status = 'read', read_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND status = 'delivered'",
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Acknowledge every unread notification for a user, passing pending
    /// rows through `delivered` as [`mark_read`](Self::mark_read) does.
    ///
    /// Returns the number of notifications that were marked read.
    pub async fn mark_all_read(pool: &PgPool, user_id: DbId) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "UPDATE notifications \
             SET status = 'delivered', updated_at = NOW() \
             WHERE user_id = $1 AND status = 'pending'",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE notifications \
             SET status = 'read', read_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND status = 'delivered'",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Number of notifications the user has not acknowledged yet.
    pub async fn unread_count(pool: &PgPool, user_id: DbId) -> Result<i64, sqlx::Error> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications \
             WHERE user_id = $1 AND status IN ('pending', 'delivered')",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// Move every pending notification whose `expires_at` is before `now` to
    /// `expired`. Returns the number of rows affected.
    pub async fn expire_overdue(pool: &PgPool, now: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE notifications \
             SET status = 'expired', updated_at = NOW() \
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
