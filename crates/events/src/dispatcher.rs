//! Producer-facing delivery path.
//!
//! [`Dispatcher::publish`] first tries the local registry. A local hit on a
//! payload with a stored id marks that row delivered; nothing else is
//! written. On a miss the notification is made durable and handed to every
//! other process:
//!
//! 1. ensure a store row exists (status `pending`) and stamp its id on the
//!    payload,
//! 2. write the payload to the user's offline queue,
//! 3. publish it on the user's bus channel.
//!
//! The offline write precedes the publish so a remote listener that
//! delivers and acknowledges the payload always finds the entry to remove.
//! Every step logs and contains its own failure; nothing is returned to the
//! producer.

use std::sync::Arc;

use fintrack_core::channels::DEFAULT_NOTIFICATION_TYPE;
use fintrack_core::notification::{NotificationContent, NotificationStatus};
use fintrack_core::types::DbId;
use fintrack_db::models::notification::NewNotification;

use crate::bus::NotificationBus;
use crate::error::DeliveryResult;
use crate::offline::OfflineQueue;
use crate::registry::ClientRegistry;
use crate::store::NotificationStore;
use crate::supervisor::TaskSupervisor;

/// Routes notifications to live connections, the offline queue and the bus.
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    store: Arc<dyn NotificationStore>,
    offline: Arc<dyn OfflineQueue>,
    bus: Arc<dyn NotificationBus>,
    supervisor: TaskSupervisor,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ClientRegistry>,
        store: Arc<dyn NotificationStore>,
        offline: Arc<dyn OfflineQueue>,
        bus: Arc<dyn NotificationBus>,
        supervisor: TaskSupervisor,
    ) -> Self {
        Self {
            registry,
            store,
            offline,
            bus,
            supervisor,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn offline(&self) -> &Arc<dyn OfflineQueue> {
        &self.offline
    }

    pub fn bus(&self) -> &Arc<dyn NotificationBus> {
        &self.bus
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Deliver `content` to `user_id` with the default notification type.
    pub async fn publish(&self, user_id: DbId, content: NotificationContent) {
        self.publish_as(user_id, DEFAULT_NOTIFICATION_TYPE, content)
            .await;
    }

    /// Deliver `content` to `user_id`, recording `notification_type` if a
    /// store row has to be created.
    pub async fn publish_as(
        &self,
        user_id: DbId,
        notification_type: &str,
        content: NotificationContent,
    ) {
        if self.deliver_local(user_id, &content) {
            tracing::debug!(
                user_id,
                notification_id = ?content.notification_id,
                "Delivered notification to local stream"
            );
            if let Some(id) = content.notification_id {
                self.mark_delivered(user_id, id).await;
            }
            return;
        }

        let content = match self.persist(user_id, notification_type, &content).await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to persist notification");
                content
            }
        };

        if let Err(e) = self.offline.store(user_id, &content).await {
            tracing::error!(
                user_id,
                notification_id = ?content.notification_id,
                error = %e,
                "Failed to write offline queue"
            );
        }

        if let Err(e) = self.bus.publish(user_id, &content).await {
            tracing::error!(
                user_id,
                notification_id = ?content.notification_id,
                error = %e,
                "Failed to publish notification to bus"
            );
        }
    }

    /// Run [`publish_as`](Self::publish_as) on a supervised background task.
    pub fn publish_detached(
        self: &Arc<Self>,
        user_id: DbId,
        notification_type: impl Into<String>,
        content: NotificationContent,
    ) {
        let dispatcher = Arc::clone(self);
        let notification_type = notification_type.into();
        self.supervisor.spawn("notification.publish", async move {
            dispatcher
                .publish_as(user_id, &notification_type, content)
                .await;
        });
    }

    /// Push onto the user's local queue if they are attached to this
    /// process.
    pub fn deliver_local(&self, user_id: DbId, content: &NotificationContent) -> bool {
        self.registry.try_enqueue(user_id, content)
    }

    /// Record that `notification_id` reached the user: mark the row
    /// delivered and drop the offline copy.
    pub async fn acknowledge(&self, user_id: DbId, notification_id: DbId) {
        self.mark_delivered(user_id, notification_id).await;

        if let Err(e) = self.offline.remove(user_id, notification_id).await {
            tracing::error!(
                user_id,
                notification_id,
                error = %e,
                "Failed to remove offline entry"
            );
        }
    }

    /// Move the user's pending row to delivered. A missing row, one owned by
    /// another user or one already past pending is left alone.
    async fn mark_delivered(&self, user_id: DbId, notification_id: DbId) {
        let result = match self.store.find(notification_id).await {
            Ok(Some(row)) if row.user_id == user_id => {
                self.store
                    .update_status(notification_id, NotificationStatus::Delivered, None)
                    .await
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                user_id,
                notification_id,
                "Notification not pending for this user"
            ),
            Err(e) => tracing::error!(
                user_id,
                notification_id,
                error = %e,
                "Failed to mark notification delivered"
            ),
        }
    }

    /// Return `content` with a durable id, creating the row when the id is
    /// absent or unknown for this user.
    async fn persist(
        &self,
        user_id: DbId,
        notification_type: &str,
        content: &NotificationContent,
    ) -> DeliveryResult<NotificationContent> {
        if let Some(id) = content.notification_id {
            if let Some(row) = self.store.find(id).await? {
                if row.user_id == user_id {
                    return Ok(content.clone());
                }
                tracing::warn!(
                    user_id,
                    notification_id = id,
                    owner = row.user_id,
                    "Notification id belongs to another user; creating a new row"
                );
            }
        }

        let input = NewNotification::from_content(user_id, notification_type, content)
            .with_bus_key(self.bus.channel_name(user_id));
        let id = self.store.create(&input).await?;
        tracing::debug!(user_id, notification_id = id, "Persisted pending notification");
        Ok(content.clone().with_id(id))
    }
}
