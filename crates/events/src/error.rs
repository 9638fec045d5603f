//! Error type shared by the delivery engine backends.

use fintrack_core::error::CoreError;

/// Failure raised by a store, queue or bus backend.
///
/// The engine's producer-facing entry points never return these; they are
/// logged at the point where an attempt is abandoned.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The notification store could not be reached or rejected a query.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The offline queue or bus could not be reached.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Convenience alias for backend results.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
