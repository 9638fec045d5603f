//! Replays missed notifications when a user attaches.

use std::collections::HashSet;
use std::sync::Arc;

use fintrack_core::notification::NotificationStatus;
use fintrack_core::types::DbId;

use crate::dispatcher::Dispatcher;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Offline queue entries handed to the live stream.
    pub from_queue: usize,
    /// Pending store rows handed to the live stream.
    pub from_store: usize,
    /// Offline entries written back because the stream went away mid-pass.
    pub requeued: usize,
}

/// Drains the offline queue and the pending store backlog into a freshly
/// attached stream.
///
/// Delivery goes through [`Dispatcher::deliver_local`], so a pass racing a
/// live publish can produce duplicates but never loses an entry.
pub struct Reconciler {
    dispatcher: Arc<Dispatcher>,
    limit: i64,
}

impl Reconciler {
    /// `limit` caps the pending store rows replayed per pass.
    pub fn new(dispatcher: Arc<Dispatcher>, limit: i64) -> Self {
        Self { dispatcher, limit }
    }

    pub async fn reconcile(&self, user_id: DbId) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();

        let drained = match self.dispatcher.offline().drain(user_id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to drain offline queue");
                Vec::new()
            }
        };

        for content in drained {
            if let Some(id) = content.notification_id {
                seen.insert(id);
            }

            if self.dispatcher.deliver_local(user_id, &content) {
                report.from_queue += 1;
                if let Some(id) = content.notification_id {
                    self.mark_delivered(user_id, id).await;
                }
                continue;
            }

            // The stream vanished; put the entry back for the next attach.
            match self.dispatcher.offline().store(user_id, &content).await {
                Ok(()) => report.requeued += 1,
                Err(e) => tracing::error!(
                    user_id,
                    notification_id = ?content.notification_id,
                    error = %e,
                    "Failed to requeue offline entry"
                ),
            }
        }

        if report.requeued == 0 {
            report.from_store = self.replay_pending(user_id, &seen).await;
        }

        tracing::info!(
            user_id,
            from_queue = report.from_queue,
            from_store = report.from_store,
            requeued = report.requeued,
            "Reconciled notification backlog"
        );
        report
    }

    /// Deliver pending store rows not already seen in the drain.
    async fn replay_pending(&self, user_id: DbId, seen: &HashSet<DbId>) -> usize {
        let rows = match self
            .dispatcher
            .store()
            .list_pending(user_id, self.limit)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to load pending notifications");
                return 0;
            }
        };

        let mut delivered = 0;
        for row in rows.iter().filter(|row| !seen.contains(&row.id)) {
            if !self.dispatcher.deliver_local(user_id, &row.content()) {
                // Rows stay pending and will be picked up next time.
                break;
            }
            self.mark_delivered(user_id, row.id).await;
            delivered += 1;
        }
        delivered
    }

    async fn mark_delivered(&self, user_id: DbId, notification_id: DbId) {
        if let Err(e) = self
            .dispatcher
            .store()
            .update_status(notification_id, NotificationStatus::Delivered, None)
            .await
        {
            tracing::error!(
                user_id,
                notification_id,
                error = %e,
                "Failed to mark notification delivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fintrack_core::channels::DEFAULT_CHANNEL_PREFIX;
    use fintrack_core::notification::NotificationContent;
    use fintrack_db::models::notification::NewNotification;

    use super::*;
    use crate::bus::LocalBus;
    use crate::offline::{MemoryOfflineQueue, OfflineQueue};
    use crate::registry::ClientRegistry;
    use crate::store::{MemoryNotificationStore, NotificationStore};
    use crate::supervisor::TaskSupervisor;

    fn setup() -> (Arc<Dispatcher>, Arc<MemoryNotificationStore>, Arc<MemoryOfflineQueue>) {
        let store = Arc::new(MemoryNotificationStore::new());
        let offline = Arc::new(MemoryOfflineQueue::new(Duration::from_secs(3600)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ClientRegistry::new()),
            store.clone(),
            offline.clone(),
            Arc::new(LocalBus::new(DEFAULT_CHANNEL_PREFIX)),
            TaskSupervisor::new(),
        ));
        (dispatcher, store, offline)
    }

    async fn pending_row(store: &MemoryNotificationStore, user_id: DbId, msg: &str) -> DbId {
        store
            .create(&NewNotification::from_content(
                user_id,
                "goal",
                &NotificationContent::new(msg),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replays_queue_then_unseen_store_rows() {
        let (dispatcher, store, offline) = setup();
        let queued = pending_row(&store, 42, "queued").await;
        let backlog = pending_row(&store, 42, "backlog").await;
        offline
            .store(42, &NotificationContent::new("queued").with_id(queued))
            .await
            .unwrap();

        let mut registration = dispatcher.registry().register(42);
        let report = Reconciler::new(dispatcher.clone(), 100).reconcile(42).await;

        assert_eq!(
            report,
            ReconcileReport {
                from_queue: 1,
                from_store: 1,
                requeued: 0
            }
        );
        let first = registration.receiver.recv().await.unwrap();
        let second = registration.receiver.recv().await.unwrap();
        assert_eq!(first.notification_id, Some(queued));
        assert_eq!(second.notification_id, Some(backlog));

        for id in [queued, backlog] {
            let row = store.find(id).await.unwrap().unwrap();
            assert_eq!(row.status().unwrap(), NotificationStatus::Delivered);
        }
        assert_eq!(offline.len(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entries_are_requeued_when_stream_is_gone() {
        let (dispatcher, store, offline) = setup();
        let id = pending_row(&store, 42, "queued").await;
        offline
            .store(42, &NotificationContent::new("queued").with_id(id))
            .await
            .unwrap();

        let report = Reconciler::new(dispatcher, 100).reconcile(42).await;

        assert_eq!(report.requeued, 1);
        assert_eq!(report.from_store, 0);
        assert_eq!(offline.len(42).await.unwrap(), 1);
        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn store_replay_respects_limit() {
        let (dispatcher, store, _offline) = setup();
        for n in 0..3 {
            pending_row(&store, 42, &format!("n{n}")).await;
        }

        let _registration = dispatcher.registry().register(42);
        let report = Reconciler::new(dispatcher, 2).reconcile(42).await;

        assert_eq!(report.from_store, 2);
        assert_eq!(store.list_pending(42, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ephemeral_entries_are_delivered_without_store_update() {
        let (dispatcher, store, offline) = setup();
        offline
            .store(42, &NotificationContent::new("ephemeral"))
            .await
            .unwrap();

        let mut registration = dispatcher.registry().register(42);
        let report = Reconciler::new(dispatcher, 100).reconcile(42).await;

        assert_eq!(report.from_queue, 1);
        assert_eq!(
            registration.receiver.recv().await.unwrap().message,
            "ephemeral"
        );
        assert_eq!(store.write_count(), 0);
    }
}
