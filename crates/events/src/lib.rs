//! Real-time notification delivery engine.
//!
//! A notification published for a user reaches them through whichever path
//! is available:
//!
//! - directly, when the user has a stream attached to this process
//!   ([`ClientRegistry`]);
//! - via the pub/sub bus, when the stream lives in another process
//!   ([`NotificationBus`]);
//! - on the next attach, from the offline queue and the pending store
//!   backlog ([`OfflineQueue`], [`NotificationStore`], [`Reconciler`]).
//!
//! Delivery is at-least-once. [`NotificationEngine`] wires the pieces
//! together.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod offline;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use bus::{BusSubscription, LocalBus, NotificationBus, RedisBus};
pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use engine::NotificationEngine;
pub use error::{DeliveryError, DeliveryResult};
pub use offline::{MemoryOfflineQueue, OfflineQueue, RedisOfflineQueue};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registry::{ClientRegistry, Registration};
pub use store::{MemoryNotificationStore, NotificationStore, PgNotificationStore};
pub use supervisor::TaskSupervisor;
pub use transport::{StreamSession, StreamTransport};
