use std::sync::Arc;

use fintrack_events::NotificationEngine;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (JWT secret, SSE keep-alive).
    pub config: Arc<ServerConfig>,
    /// Notification delivery engine: store, registry, bus and dispatcher.
    pub engine: Arc<NotificationEngine>,
}
