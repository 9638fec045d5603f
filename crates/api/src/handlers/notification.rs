//! Handlers for the `/notifications` resource.
//!
//! All endpoints require authentication via [`AuthUser`]; the producer
//! ingress additionally requires [`RequirePublisher`].

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use fintrack_core::channels::DEFAULT_NOTIFICATION_TYPE;
use fintrack_core::error::CoreError;
use fintrack_core::notification::{NotificationContent, NotificationMeta, NotificationStatus};
use fintrack_core::types::{DbId, Timestamp};
use fintrack_db::models::notification::{NewNotification, Notification};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::middleware::rbac::RequirePublisher;
use crate::response::DataResponse;
use crate::state::AppState;

/// SSE event name carried by every notification frame.
pub const SSE_EVENT_NAME: &str = "notification";

// ---------------------------------------------------------------------------
// Query / request / response types
// ---------------------------------------------------------------------------

/// Query parameters for `GET /notifications`.
#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    /// Only return notifications in this status.
    pub status: Option<String>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

const MAX_LIMIT: i64 = 100;
const DEFAULT_LIMIT: i64 = 50;

/// Body of `POST /notifications/publish`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub user_id: DbId,
    pub notification_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub meta: NotificationMeta,
    pub expires_at: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub notification_id: DbId,
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub marked_read: u64,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// GET /api/v1/notifications/stream
///
/// Attach a server-sent event stream. Each frame carries one JSON
/// notification payload. The stream ends when the client disconnects or the
/// server shuts down.
pub async fn stream_notifications(
    auth: AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state.engine.attach(auth.user_id).await;

    let frames = session
        .into_stream()
        .filter_map(|content| futures::future::ready(sse_event(&content)))
        .map(Ok::<_, Infallible>);

    let sse = Sse::new(frames).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(state.config.sse_keepalive_secs)),
    );

    ([(header::CONNECTION, "keep-alive")], sse)
}

/// Encode one payload as an SSE event, or `None` if it cannot be
/// serialized.
pub fn sse_event(content: &NotificationContent) -> Option<Event> {
    let data = match content.to_wire() {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(
                notification_id = ?content.notification_id,
                error = %e,
                "Dropping unserializable notification frame"
            );
            return None;
        }
    };

    let mut event = Event::default().event(SSE_EVENT_NAME).data(data);
    if let Some(id) = content.notification_id {
        event = event.id(id.to_string());
    }
    Some(event)
}

// ---------------------------------------------------------------------------
// Listing and acknowledgement
// ---------------------------------------------------------------------------

/// GET /api/v1/notifications
///
/// List the authenticated user's notifications, newest first.
pub async fn list_notifications(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<NotificationQuery>,
) -> AppResult<Json<DataResponse<Vec<Notification>>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    let status = params
        .status
        .as_deref()
        .map(str::parse::<NotificationStatus>)
        .transpose()?;

    let notifications = state
        .engine
        .store()
        .list_for_user(auth.user_id, status, limit, offset)
        .await?;

    Ok(Json(DataResponse {
        data: notifications,
    }))
}

/// POST /api/v1/notifications/{id}/read
///
/// Acknowledge a single notification. Returns 204 No Content on success,
/// or 404 if it does not belong to the user or is already read or expired.
pub async fn mark_read(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let found = state
        .engine
        .store()
        .mark_read(notification_id, auth.user_id)
        .await?;

    if !found {
        return Err(AppError::Core(CoreError::NotFound {
            entity: "Notification",
            id: notification_id,
        }));
    }

    // A read notification must not be replayed on the next attach.
    if let Err(e) = state
        .engine
        .offline()
        .remove(auth.user_id, notification_id)
        .await
    {
        tracing::warn!(
            user_id = auth.user_id,
            notification_id,
            error = %e,
            "Failed to remove offline entry for read notification"
        );
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/notifications/read-all
pub async fn mark_all_read(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<MarkAllReadResponse>>> {
    let marked_read = state.engine.store().mark_all_read(auth.user_id).await?;

    Ok(Json(DataResponse {
        data: MarkAllReadResponse { marked_read },
    }))
}

/// GET /api/v1/notifications/unread-count
pub async fn unread_count(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<UnreadCountResponse>>> {
    let count = state.engine.store().unread_count(auth.user_id).await?;

    Ok(Json(DataResponse {
        data: UnreadCountResponse { count },
    }))
}

// ---------------------------------------------------------------------------
// Producer ingress
// ---------------------------------------------------------------------------

/// POST /api/v1/notifications/publish
///
/// Persist a notification and hand it to the dispatcher in the background.
/// Returns 202 Accepted with the new id; delivery outcome is not reported.
pub async fn publish(
    RequirePublisher(publisher): RequirePublisher,
    State(state): State<AppState>,
    Json(input): Json<PublishRequest>,
) -> AppResult<impl IntoResponse> {
    if input.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".into()));
    }
    if input.expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(AppError::BadRequest(
            "expires_at must be in the future".into(),
        ));
    }

    let notification_type = input
        .notification_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_NOTIFICATION_TYPE.to_string());
    let content = NotificationContent::new(input.message).with_meta(input.meta);

    let mut new = NewNotification::from_content(input.user_id, &notification_type, &content)
        .with_bus_key(state.engine.bus().channel_name(input.user_id));
    new.expires_at = input.expires_at;

    let notification_id = state.engine.store().create(&new).await?;

    tracing::info!(
        publisher_id = publisher.user_id,
        user_id = input.user_id,
        notification_id,
        %notification_type,
        "Accepted notification for delivery"
    );

    state.engine.dispatcher().publish_detached(
        input.user_id,
        notification_type,
        content.with_id(notification_id),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: PublishResponse { notification_id },
        }),
    ))
}
