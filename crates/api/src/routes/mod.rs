pub mod health;
pub mod notification;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /notifications                 list (auth)
/// /notifications/stream          SSE delivery stream (auth)
/// /notifications/unread-count    unread count (auth)
/// /notifications/read-all        acknowledge all (auth)
/// /notifications/{id}/read       acknowledge one (auth)
/// /notifications/publish         producer ingress (admin or service)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/notifications", notification::router())
}
