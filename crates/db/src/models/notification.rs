//! Notification entity model and DTOs.

use fintrack_core::error::CoreError;
use fintrack_core::notification::{NotificationContent, NotificationMeta, NotificationStatus};
use fintrack_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `notifications` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Notification {
    pub id: DbId,
    pub user_id: DbId,
    pub message: String,
    pub notification_type: String,
    pub status: String,
    pub meta: Json<NotificationMeta>,
    pub bus_key: Option<String>,
    pub read_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Notification {
    /// Parsed lifecycle status.
    pub fn status(&self) -> Result<NotificationStatus, CoreError> {
        self.status.parse()
    }

    /// The wire projection delivered to clients.
    pub fn content(&self) -> NotificationContent {
        NotificationContent {
            notification_id: Some(self.id),
            message: self.message.clone(),
            meta: self.meta.0.clone(),
        }
    }
}

/// DTO for inserting a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub user_id: DbId,
    pub message: String,
    pub notification_type: String,
    #[serde(default = "default_status")]
    pub status: NotificationStatus,
    #[serde(default)]
    pub meta: NotificationMeta,
    pub bus_key: Option<String>,
    pub expires_at: Option<Timestamp>,
}

fn default_status() -> NotificationStatus {
    NotificationStatus::Pending
}

impl NewNotification {
    /// A pending notification built from a wire payload.
    pub fn from_content(
        user_id: DbId,
        notification_type: impl Into<String>,
        content: &NotificationContent,
    ) -> Self {
        Self {
            user_id,
            message: content.message.clone(),
            notification_type: notification_type.into(),
            status: NotificationStatus::Pending,
            meta: content.meta.clone(),
            bus_key: None,
            expires_at: None,
        }
    }

    /// Record the bus channel the notification is fanned out on.
    pub fn with_bus_key(mut self, bus_key: impl Into<String>) -> Self {
        self.bus_key = Some(bus_key.into());
        self
    }
}
