//! Wiring of the delivery engine components.

use std::sync::Arc;
use std::time::Duration;

use fintrack_core::notification::NotificationContent;
use fintrack_core::types::DbId;
use fintrack_db::DbPool;
use tokio_util::sync::CancellationToken;

use crate::bus::{LocalBus, NotificationBus, RedisBus};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DeliveryResult;
use crate::offline::{MemoryOfflineQueue, OfflineQueue, RedisOfflineQueue};
use crate::reconciler::Reconciler;
use crate::registry::ClientRegistry;
use crate::store::{MemoryNotificationStore, NotificationStore, PgNotificationStore};
use crate::supervisor::TaskSupervisor;
use crate::transport::{StreamSession, StreamTransport};

/// The assembled delivery engine shared through application state.
pub struct NotificationEngine {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    transport: StreamTransport,
    shutdown: CancellationToken,
}

impl NotificationEngine {
    /// Assemble an engine from explicit backends.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn NotificationStore>,
        offline: Arc<dyn OfflineQueue>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ClientRegistry::new()),
            store,
            offline,
            bus,
            TaskSupervisor::new(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&dispatcher),
            config.reconcile_limit,
        ));
        let transport = StreamTransport::new(Arc::clone(&dispatcher), reconciler);

        Self {
            config,
            dispatcher,
            transport,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the production engine: PostgreSQL store plus Redis bus and
    /// offline queue, or in-process ones when no Redis URL is configured.
    pub async fn connect(config: EngineConfig, pool: DbPool) -> DeliveryResult<Self> {
        let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool));

        let (offline, bus): (Arc<dyn OfflineQueue>, Arc<dyn NotificationBus>) =
            match config.redis_url.as_deref() {
                Some(url) => {
                    let offline = RedisOfflineQueue::connect(
                        url,
                        config.offline_prefix.clone(),
                        config.offline_ttl,
                    )
                    .await?;
                    let bus = RedisBus::connect(url, config.channel_prefix.clone()).await?;
                    tracing::info!("Notification engine using Redis bus and offline queue");
                    (Arc::new(offline), Arc::new(bus))
                }
                None => {
                    tracing::warn!(
                        "REDIS_URL not set; notification bus and offline queue are in-process"
                    );
                    (
                        Arc::new(MemoryOfflineQueue::new(config.offline_ttl)),
                        Arc::new(LocalBus::new(config.channel_prefix.clone())),
                    )
                }
            };

        Ok(Self::new(config, store, offline, bus))
    }

    /// Engine with every backend in-process.
    pub fn in_memory(config: EngineConfig) -> Self {
        let offline = Arc::new(MemoryOfflineQueue::new(config.offline_ttl));
        let bus = Arc::new(LocalBus::new(config.channel_prefix.clone()));
        Self::new(
            config,
            Arc::new(MemoryNotificationStore::new()),
            offline,
            bus,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        self.dispatcher.registry()
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        self.dispatcher.store()
    }

    pub fn offline(&self) -> &Arc<dyn OfflineQueue> {
        self.dispatcher.offline()
    }

    pub fn bus(&self) -> &Arc<dyn NotificationBus> {
        self.dispatcher.bus()
    }

    /// Attach a client stream. The session ends on its own drop or on
    /// engine shutdown.
    pub async fn attach(&self, user_id: DbId) -> StreamSession {
        self.transport
            .attach(user_id, self.shutdown.child_token())
            .await
    }

    pub async fn publish(&self, user_id: DbId, content: NotificationContent) {
        self.dispatcher.publish(user_id, content).await;
    }

    /// End every stream and wait for in-flight background work.
    ///
    /// Returns `false` if tasks were still running when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.registry().close_all();
        self.dispatcher.supervisor().shutdown(timeout).await
    }
}
