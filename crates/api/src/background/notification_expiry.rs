//! Periodic expiry of pending notifications.
//!
//! Moves `pending` rows whose `expires_at` has passed to `expired` so they
//! are no longer replayed on reconnect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fintrack_events::NotificationStore;
use tokio_util::sync::CancellationToken;

/// Run one sweep. Returns the number of rows expired.
pub async fn sweep(store: &dyn NotificationStore) -> u64 {
    match store.expire_overdue(Utc::now()).await {
        Ok(expired) => {
            if expired > 0 {
                tracing::info!(expired, "Notification expiry: expired pending rows");
            } else {
                tracing::debug!("Notification expiry: nothing to expire");
            }
            expired
        }
        Err(e) => {
            tracing::error!(error = %e, "Notification expiry: sweep failed");
            0
        }
    }
}

/// Run the expiry loop every `every` until `cancel` is triggered.
pub async fn run(store: Arc<dyn NotificationStore>, every: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = every.as_secs(),
        "Notification expiry job started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Notification expiry job stopping");
                break;
            }
            _ = interval.tick() => {
                sweep(store.as_ref()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fintrack_core::notification::{NotificationContent, NotificationStatus};
    use fintrack_db::models::notification::NewNotification;
    use fintrack_events::MemoryNotificationStore;

    use super::*;

    #[tokio::test]
    async fn sweep_expires_overdue_pending_rows() {
        let store = MemoryNotificationStore::new();
        let mut input =
            NewNotification::from_content(42, "goal", &NotificationContent::new("Goal met"));
        input.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let id = store.create(&input).await.unwrap();

        assert_eq!(sweep(&store).await, 1);
        assert_eq!(sweep(&store).await, 0);

        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), NotificationStatus::Expired);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store: Arc<dyn NotificationStore> = Arc::new(MemoryNotificationStore::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(store, Duration::from_millis(10), cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("job stops promptly")
            .expect("job does not panic");
    }
}
