use crate::types::DbId;

/// Domain errors shared by the engine and the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The entity does not exist or is not visible to the caller.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    /// Input that parses but breaks a domain rule, such as an unknown status.
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}
