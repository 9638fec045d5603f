//! Cross-process publish/subscribe bridge keyed by user id.
//!
//! A notification that cannot be delivered by the local process is
//! published on the user's channel; whichever process holds that user's
//! stream has a [`BusSubscription`] open on the same channel and re-enters
//! local delivery. Every subscriber receives a copy.
//!
//! Two backends implement [`NotificationBus`]:
//!
//! - [`RedisBus`] for multi-instance deployments (Redis `PUBLISH` /
//!   `SUBSCRIBE`).
//! - [`LocalBus`] for single-process deployments and tests, backed by one
//!   `tokio::sync::broadcast` channel per user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fintrack_core::channels::user_channel;
use fintrack_core::notification::NotificationContent;
use fintrack_core::types::DbId;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::DeliveryResult;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Broadcast channel per user, shared by every process in a deployment.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Serialize `content` and publish it on the user's channel.
    async fn publish(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()>;

    /// Open a subscription on the user's channel.
    ///
    /// The subscription yields decoded payloads until it is dropped.
    async fn subscribe(&self, user_id: DbId) -> DeliveryResult<BusSubscription>;

    /// Channel name used for `user_id`.
    fn channel_name(&self, user_id: DbId) -> String;

    /// Number of subscriptions currently open through this bus.
    fn active_subscriptions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Counts open subscriptions.
#[derive(Clone, Default)]
struct SubscriptionGauge(Arc<AtomicUsize>);

impl SubscriptionGauge {
    fn acquire(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(Arc::clone(&self.0))
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An open subscription on one user's channel.
///
/// Dropping it closes the underlying subscription.
pub struct BusSubscription {
    user_id: DbId,
    messages: BoxStream<'static, NotificationContent>,
    _gauge: GaugeGuard,
}

impl BusSubscription {
    fn new(
        user_id: DbId,
        messages: BoxStream<'static, NotificationContent>,
        gauge: &SubscriptionGauge,
    ) -> Self {
        Self {
            user_id,
            messages,
            _gauge: gauge.acquire(),
        }
    }

    pub fn user_id(&self) -> DbId {
        self.user_id
    }

    /// Wait for the next decodable message.
    ///
    /// Returns `None` once the underlying channel has closed.
    pub async fn next(&mut self) -> Option<NotificationContent> {
        self.messages.next().await
    }
}

/// Decode one bus frame, logging and dropping malformed payloads.
fn decode_frame(user_id: DbId, raw: &str) -> Option<NotificationContent> {
    match NotificationContent::from_wire(raw) {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Dropping malformed bus payload");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Redis pub/sub bus.
///
/// Publishes go through a shared [`ConnectionManager`] that reconnects on
/// its own; each subscription holds a dedicated pub/sub connection, so
/// closing a stream closes exactly one Redis subscription.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    channel_prefix: String,
    gauge: SubscriptionGauge,
}

impl RedisBus {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, channel_prefix: impl Into<String>) -> DeliveryResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            channel_prefix: channel_prefix.into(),
            gauge: SubscriptionGauge::default(),
        })
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn publish(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()> {
        let channel = self.channel_name(user_id);
        let payload = content.to_wire()?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(&channel, payload).await?;
        tracing::debug!(user_id, %channel, receivers, "Published notification to bus");
        Ok(())
    }

    async fn subscribe(&self, user_id: DbId) -> DeliveryResult<BusSubscription> {
        let channel = self.channel_name(user_id);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::debug!(user_id, %channel, "Opened bus subscription");

        let messages = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let decoded = match msg.get_payload::<String>() {
                    Ok(raw) => decode_frame(user_id, &raw),
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "Dropping non-text bus payload");
                        None
                    }
                };
                futures::future::ready(decoded)
            })
            .boxed();

        Ok(BusSubscription::new(user_id, messages, &self.gauge))
    }

    fn channel_name(&self, user_id: DbId) -> String {
        user_channel(&self.channel_prefix, user_id)
    }

    fn active_subscriptions(&self) -> usize {
        self.gauge.get()
    }
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// Buffer capacity for each per-user broadcast channel.
const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// In-process bus: one broadcast channel per user.
///
/// Payloads are serialized exactly as on Redis so subscribers exercise the
/// same decode path.
pub struct LocalBus {
    channels: Mutex<HashMap<DbId, broadcast::Sender<String>>>,
    channel_prefix: String,
    gauge: SubscriptionGauge,
}

impl LocalBus {
    pub fn new(channel_prefix: impl Into<String>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_prefix: channel_prefix.into(),
            gauge: SubscriptionGauge::default(),
        }
    }
}

#[async_trait]
impl NotificationBus for LocalBus {
    async fn publish(&self, user_id: DbId, content: &NotificationContent) -> DeliveryResult<()> {
        let payload = content.to_wire()?;
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(sender) = channels.get(&user_id) else {
            tracing::debug!(user_id, "No bus subscribers for user");
            return Ok(());
        };

        if sender.send(payload).is_err() {
            // Every receiver is gone; forget the channel.
            channels.remove(&user_id);
            tracing::debug!(user_id, "No bus subscribers for user");
        }
        Ok(())
    }

    async fn subscribe(&self, user_id: DbId) -> DeliveryResult<BusSubscription> {
        let receiver = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(user_id)
                .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let messages = BroadcastStream::new(receiver)
            .filter_map(move |result| {
                let decoded = match result {
                    Ok(raw) => decode_frame(user_id, &raw),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(user_id, skipped, "Bus subscriber lagged");
                        None
                    }
                };
                futures::future::ready(decoded)
            })
            .boxed();

        Ok(BusSubscription::new(user_id, messages, &self.gauge))
    }

    fn channel_name(&self, user_id: DbId) -> String {
        user_channel(&self.channel_prefix, user_id)
    }

    fn active_subscriptions(&self) -> usize {
        self.gauge.get()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
