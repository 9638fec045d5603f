//! Per-connection delivery loop.
//!
//! [`StreamTransport::attach`] wires one client connection into the engine:
//! it registers the user's output queue, opens the user's bus subscription
//! on a supervised listener task and starts a reconciliation pass. The
//! returned [`StreamSession`] is the only reader of that queue.
//!
//! Payloads still buffered when a session ends are handed back to the
//! dispatcher, so they reach a newer connection or the offline queue.

use std::sync::Arc;

use fintrack_core::notification::NotificationContent;
use fintrack_core::types::DbId;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::BusSubscription;
use crate::dispatcher::Dispatcher;
use crate::reconciler::Reconciler;
use crate::registry::OutboundReceiver;

/// Attaches client connections to the delivery engine.
#[derive(Clone)]
pub struct StreamTransport {
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
}

impl StreamTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            dispatcher,
            reconciler,
        }
    }

    /// Attach a stream for `user_id`.
    ///
    /// Cancelling `cancel` ends the session and its bus listener. A failed
    /// bus subscription is logged and the session runs with local delivery
    /// and reconciliation only.
    pub async fn attach(&self, user_id: DbId, cancel: CancellationToken) -> StreamSession {
        let registration = self
            .dispatcher
            .registry()
            .register_until(user_id, cancel.clone());
        let connection_id = registration.connection_id;

        match self.dispatcher.bus().subscribe(user_id).await {
            Ok(subscription) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let listener_cancel = cancel.clone();
                self.dispatcher.supervisor().spawn(
                    "notification.bus_listener",
                    run_bus_listener(dispatcher, subscription, listener_cancel),
                );
            }
            Err(e) => tracing::error!(
                user_id,
                error = %e,
                "Failed to subscribe to notification bus"
            ),
        }

        let reconciler = Arc::clone(&self.reconciler);
        self.dispatcher
            .supervisor()
            .spawn("notification.reconcile", async move {
                reconciler.reconcile(user_id).await;
            });

        tracing::info!(user_id, %connection_id, "Notification stream attached");

        StreamSession {
            user_id,
            connection_id,
            receiver: registration.receiver,
            cancel,
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

/// Forward bus messages for one user into local delivery until cancelled.
async fn run_bus_listener(
    dispatcher: Arc<Dispatcher>,
    mut subscription: BusSubscription,
    cancel: CancellationToken,
) {
    let user_id = subscription.user_id();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.next() => {
                let Some(content) = message else {
                    tracing::warn!(user_id, "Bus subscription closed");
                    break;
                };
                if !dispatcher.deliver_local(user_id, &content) {
                    tracing::debug!(user_id, "Bus message arrived after stream closed");
                    continue;
                }
                if let Some(id) = content.notification_id {
                    dispatcher.acknowledge(user_id, id).await;
                }
            }
        }
    }
    tracing::debug!(user_id, "Bus listener stopped");
}

/// One attached client stream.
///
/// Dropping the session cancels its token, releases the registry entry if
/// it still belongs to this connection and republishes unread payloads.
pub struct StreamSession {
    user_id: DbId,
    connection_id: Uuid,
    receiver: OutboundReceiver,
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
}

impl StreamSession {
    pub fn user_id(&self) -> DbId {
        self.user_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Token whose cancellation ends this session.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the session is cancelled or its queue was closed
    /// by a newer connection or shutdown.
    pub async fn next_frame(&mut self) -> Option<NotificationContent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.release();
                None
            }
            frame = self.receiver.recv() => frame,
        }
    }

    fn release(&self) {
        self.dispatcher
            .registry()
            .release(self.user_id, self.connection_id);
    }

    /// Hand payloads that were queued but never read back to the
    /// dispatcher.
    fn requeue_unread(&mut self) {
        self.receiver.close();
        let mut unread = Vec::new();
        while let Ok(content) = self.receiver.try_recv() {
            unread.push(content);
        }
        if unread.is_empty() {
            return;
        }

        let user_id = self.user_id;
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(
                user_id,
                count = unread.len(),
                "No runtime to requeue unread notifications"
            );
            return;
        }
        tracing::debug!(user_id, count = unread.len(), "Requeueing unread notifications");
        let dispatcher = Arc::clone(&self.dispatcher);
        self.dispatcher
            .supervisor()
            .spawn("notification.requeue", async move {
                for content in unread {
                    dispatcher.publish(user_id, content).await;
                }
            });
    }

    /// Turn the session into a stream of payloads.
    pub fn into_stream(self) -> impl Stream<Item = NotificationContent> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            let frame = session.next_frame().await?;
            Some((frame, session))
        })
    }

    /// End the session now.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.release();
        self.requeue_unread();
        tracing::info!(
            user_id = self.user_id,
            connection_id = %self.connection_id,
            "Notification stream detached"
        );
    }
}
