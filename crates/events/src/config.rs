use std::time::Duration;

use fintrack_core::channels::{DEFAULT_CHANNEL_PREFIX, DEFAULT_OFFLINE_PREFIX};

/// Default lifetime of a user's offline hash: 7 days.
const DEFAULT_OFFLINE_TTL_SECS: u64 = 7 * 24 * 3600;

/// Default cap on pending store rows replayed per reconnect.
const DEFAULT_RECONCILE_LIMIT: i64 = 500;

/// Delivery engine configuration loaded from environment variables.
///
/// When `redis_url` is `None` the engine runs with the in-process bus and
/// offline queue, which only makes sense for a single instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection URL for the bus and the offline queue.
    pub redis_url: Option<String>,
    /// Prefix of the per-user pub/sub channel.
    pub channel_prefix: String,
    /// Prefix of the per-user offline hash key.
    pub offline_prefix: String,
    /// TTL applied to a user's offline hash on every write.
    pub offline_ttl: Duration,
    /// Maximum pending store rows replayed per reconciliation pass.
    pub reconcile_limit: i64,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                   |
    /// |---------------------------------|---------------------------|
    /// | `REDIS_URL`                     | unset (in-process)        |
    /// | `NOTIFICATION_CHANNEL_PREFIX`   | `notifications:user:`     |
    /// | `NOTIFICATION_OFFLINE_PREFIX`   | `notifications:offline:`  |
    /// | `NOTIFICATION_OFFLINE_TTL_SECS` | `604800`                  |
    /// | `NOTIFICATION_RECONCILE_LIMIT`  | `500`                     |
    pub fn from_env() -> Self {
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let channel_prefix = std::env::var("NOTIFICATION_CHANNEL_PREFIX")
            .unwrap_or_else(|_| DEFAULT_CHANNEL_PREFIX.into());

        let offline_prefix = std::env::var("NOTIFICATION_OFFLINE_PREFIX")
            .unwrap_or_else(|_| DEFAULT_OFFLINE_PREFIX.into());

        let offline_ttl_secs: u64 = std::env::var("NOTIFICATION_OFFLINE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_OFFLINE_TTL_SECS);

        let reconcile_limit: i64 = std::env::var("NOTIFICATION_RECONCILE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|limit: &i64| *limit > 0)
            .unwrap_or(DEFAULT_RECONCILE_LIMIT);

        Self {
            redis_url,
            channel_prefix,
            offline_prefix,
            offline_ttl: Duration::from_secs(offline_ttl_secs),
            reconcile_limit,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
            offline_prefix: DEFAULT_OFFLINE_PREFIX.into(),
            offline_ttl: Duration::from_secs(DEFAULT_OFFLINE_TTL_SECS),
            reconcile_limit: DEFAULT_RECONCILE_LIMIT,
        }
    }
}
