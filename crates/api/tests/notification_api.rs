//! Integration tests for the `/api/v1/notifications` endpoints.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use fintrack_core::notification::{NotificationContent, NotificationStatus};
use fintrack_db::models::notification::NewNotification;
use http_body_util::BodyExt;
use serde_json::json;

use common::{body_json, build_test_app, get, post, token, TestApp};

async fn seed(app: &TestApp, user_id: i64, message: &str) -> i64 {
    app.engine
        .store()
        .create(&NewNotification::from_content(
            user_id,
            "goal",
            &NotificationContent::new(message),
        ))
        .await
        .unwrap()
}

/// Read SSE body chunks until one full event (terminated by a blank line)
/// has arrived.
async fn next_sse_event(body: &mut Body) -> String {
    let mut buffer = String::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("SSE frame within timeout")
            .expect("stream still open")
            .expect("frame is not an error");
        if let Ok(data) = frame.into_data() {
            buffer.push_str(std::str::from_utf8(&data).unwrap());
        }
        if buffer.contains("\n\n") {
            return buffer;
        }
    }
}

fn sse_field<'a>(event: &'a str, name: &str) -> Option<&'a str> {
    event
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
        .map(str::trim_start)
}

fn sse_data(event: &str) -> serde_json::Value {
    serde_json::from_str(sse_field(event, "data").expect("data line")).unwrap()
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn endpoints_require_bearer_token() {
    let app = build_test_app();

    for uri in [
        "/api/v1/notifications",
        "/api/v1/notifications/stream",
        "/api/v1/notifications/unread-count",
    ] {
        let response = get(&app, uri, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }

    let response = get(&app, "/api/v1/notifications", Some("not-a-jwt")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNAUTHORIZED");
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_delivers_published_notification_as_sse_frame() {
    let app = build_test_app();
    let user = token(42, "user");

    let response: Response<Body> =
        get(&app, "/api/v1/notifications/stream", Some(&user)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache");
    assert_eq!(headers["connection"], "keep-alive");
    assert!(app.engine.registry().is_registered(42));

    app.engine
        .publish(42, NotificationContent::new("Goal met").with_id(8))
        .await;

    let mut body = response.into_body();
    let event = next_sse_event(&mut body).await;
    assert_eq!(sse_field(&event, "event"), Some("notification"), "{event}");
    assert_eq!(sse_field(&event, "id"), Some("8"), "{event}");
    let data = sse_data(&event);
    assert_eq!(data["notification_id"], 8);
    assert_eq!(data["message"], "Goal met");
    assert_eq!(data["meta"]["tags"], json!([]));
}

#[tokio::test]
async fn dropping_stream_body_detaches_user() {
    let app = build_test_app();
    let user = token(42, "user");

    let response = get(&app, "/api/v1/notifications/stream", Some(&user)).await;
    assert!(app.engine.registry().is_registered(42));

    drop(response);

    assert!(!app.engine.registry().is_registered(42));
}

#[tokio::test]
async fn stream_replays_backlog_on_attach() {
    let app = build_test_app();
    let id = seed(&app, 42, "Missed while offline").await;

    let response = get(
        &app,
        "/api/v1/notifications/stream",
        Some(&token(42, "user")),
    )
    .await;
    let mut body = response.into_body();

    let data = sse_data(&next_sse_event(&mut body).await);
    assert_eq!(data["notification_id"], id);
    assert_eq!(data["message"], "Missed while offline");
}

// ---------------------------------------------------------------------------
// Listing and acknowledgement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_returns_own_notifications_newest_first() {
    let app = build_test_app();
    let first = seed(&app, 42, "first").await;
    let second = seed(&app, 42, "second").await;
    seed(&app, 7, "someone else").await;

    let response = get(&app, "/api/v1/notifications", Some(&token(42, "user"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let ids: Vec<i64> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![second, first]);
    assert_eq!(json["data"][0]["status"], "pending");
}

#[tokio::test]
async fn list_filters_by_status_and_rejects_unknown_status() {
    let app = build_test_app();
    let read = seed(&app, 42, "read me").await;
    seed(&app, 42, "still pending").await;
    let user = token(42, "user");

    let response = post(
        &app,
        &format!("/api/v1/notifications/{read}/read"),
        Some(&user),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let json = body_json(get(&app, "/api/v1/notifications?status=read", Some(&user)).await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
    assert_eq!(json["data"][0]["id"], read);

    let response = get(&app, "/api/v1/notifications?status=bogus", Some(&user)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn mark_read_of_foreign_or_read_notification_is_404() {
    let app = build_test_app();
    let id = seed(&app, 7, "not yours").await;

    let response = post(
        &app,
        &format!("/api/v1/notifications/{id}/read"),
        Some(&token(42, "user")),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let owner = token(7, "user");
    let uri = format!("/api/v1/notifications/{id}/read");
    assert_eq!(
        post(&app, &uri, Some(&owner), None).await.status(),
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        post(&app, &uri, Some(&owner), None).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn mark_read_removes_offline_copy() {
    let app = build_test_app();
    app.engine
        .publish(42, NotificationContent::new("queued"))
        .await;
    assert_eq!(app.engine.offline().len(42).await.unwrap(), 1);
    let id = app.engine.store().list_pending(42, 10).await.unwrap()[0].id;

    let response = post(
        &app,
        &format!("/api/v1/notifications/{id}/read"),
        Some(&token(42, "user")),
        None,
    )
    .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.engine.offline().len(42).await.unwrap(), 0);
    let row = app.engine.store().find(id).await.unwrap().unwrap();
    assert_eq!(row.status().unwrap(), NotificationStatus::Read);
    assert!(row.read_at.is_some());
}

#[tokio::test]
async fn unread_count_and_read_all() {
    let app = build_test_app();
    seed(&app, 42, "a").await;
    seed(&app, 42, "b").await;
    let user = token(42, "user");

    let json = body_json(get(&app, "/api/v1/notifications/unread-count", Some(&user)).await).await;
    assert_eq!(json["data"]["count"], 2);

    let json =
        body_json(post(&app, "/api/v1/notifications/read-all", Some(&user), None).await).await;
    assert_eq!(json["data"]["marked_read"], 2);

    let json = body_json(get(&app, "/api/v1/notifications/unread-count", Some(&user)).await).await;
    assert_eq!(json["data"]["count"], 0);
}

// ---------------------------------------------------------------------------
// Producer ingress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_requires_publisher_role() {
    let app = build_test_app();
    let body = json!({ "user_id": 42, "message": "hello" });

    let response = post(
        &app,
        "/api/v1/notifications/publish",
        Some(&token(1, "user")),
        Some(body),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "FORBIDDEN");
}

#[tokio::test]
async fn publish_persists_and_queues_for_offline_user() {
    let app = build_test_app();
    let body = json!({
        "user_id": 42,
        "notification_type": "goal",
        "message": "Goal met",
        "meta": { "url": "/goals/3", "tags": ["goal"] }
    });

    let response = post(
        &app,
        "/api/v1/notifications/publish",
        Some(&token(1, "service")),
        Some(body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let id = body_json(response).await["data"]["notification_id"]
        .as_i64()
        .unwrap();

    let row = app.engine.store().find(id).await.unwrap().unwrap();
    assert_eq!(row.user_id, 42);
    assert_eq!(row.notification_type, "goal");
    assert_eq!(row.status().unwrap(), NotificationStatus::Pending);
    assert_eq!(row.bus_key.as_deref(), Some("notifications:user:42"));

    assert!(
        app.engine
            .dispatcher()
            .supervisor()
            .shutdown(Duration::from_secs(5))
            .await
    );
    let queued = app.engine.offline().drain(42).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification_id, Some(id));
    assert_eq!(queued[0].meta.url.as_deref(), Some("/goals/3"));
}

#[tokio::test]
async fn publish_reaches_attached_stream() {
    let app = build_test_app();
    let response = get(
        &app,
        "/api/v1/notifications/stream",
        Some(&token(42, "user")),
    )
    .await;
    let mut body = response.into_body();

    let published = post(
        &app,
        "/api/v1/notifications/publish",
        Some(&token(1, "admin")),
        Some(json!({ "user_id": 42, "message": "Live" })),
    )
    .await;
    let id = body_json(published).await["data"]["notification_id"]
        .as_i64()
        .unwrap();

    let data = sse_data(&next_sse_event(&mut body).await);
    assert_eq!(data["notification_id"], id);
    assert_eq!(data["message"], "Live");

    let mut status = NotificationStatus::Pending;
    for _ in 0..100 {
        let row = app.engine.store().find(id).await.unwrap().unwrap();
        status = row.status().unwrap();
        if status == NotificationStatus::Delivered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, NotificationStatus::Delivered);

    let json = body_json(
        get(
            &app,
            "/api/v1/notifications?status=pending",
            Some(&token(42, "user")),
        )
        .await,
    )
    .await;
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn publish_rejects_empty_message_and_past_expiry() {
    let app = build_test_app();
    let service = token(1, "service");

    let response = post(
        &app,
        "/api/v1/notifications/publish",
        Some(&service),
        Some(json!({ "user_id": 42, "message": "   " })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post(
        &app,
        "/api/v1/notifications/publish",
        Some(&service),
        Some(json!({
            "user_id": 42,
            "message": "late",
            "expires_at": "2000-01-01T00:00:00Z"
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}
