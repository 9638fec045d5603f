//! Naming conventions for per-user bus channels and offline queue keys.
//!
//! Every process in a deployment must derive the same names from a user id,
//! otherwise a publish on one instance never reaches the subscriber held by
//! another.

use crate::types::DbId;

/// Default prefix for the per-user pub/sub channel.
pub const DEFAULT_CHANNEL_PREFIX: &str = "notifications:user:";

/// Default prefix for the per-user offline hash.
pub const DEFAULT_OFFLINE_PREFIX: &str = "notifications:offline:";

/// Notification type recorded when a producer does not supply one.
pub const DEFAULT_NOTIFICATION_TYPE: &str = "general";

/// Bus channel name for a user.
pub fn user_channel(prefix: &str, user_id: DbId) -> String {
    format!("{prefix}{user_id}")
}

/// Offline hash key for a user.
pub fn offline_key(prefix: &str, user_id: DbId) -> String {
    format!("{prefix}{user_id}")
}
