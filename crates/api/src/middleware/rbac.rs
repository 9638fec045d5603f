//! Role-based access control extractors.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fintrack_core::error::CoreError;
use fintrack_core::roles::{ROLE_ADMIN, ROLE_SERVICE};

use super::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

/// Requires the `admin` or `service` role. Rejects with 403 Forbidden
/// otherwise.
///
/// Guards the internal producer ingress; end users never publish.
pub struct RequirePublisher(pub AuthUser);

impl FromRequestParts<AppState> for RequirePublisher {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.role != ROLE_ADMIN && user.role != ROLE_SERVICE {
            return Err(AppError::Core(CoreError::Forbidden(
                "Admin or service role required".into(),
            )));
        }
        Ok(RequirePublisher(user))
    }
}
