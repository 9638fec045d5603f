#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use fintrack_api::auth::jwt::{generate_access_token, JwtConfig};
use fintrack_api::config::ServerConfig;
use fintrack_api::router::build_app_router;
use fintrack_api::state::AppState;
use fintrack_core::types::DbId;
use fintrack_events::{EngineConfig, NotificationEngine};

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        sse_keepalive_secs: 15,
        expiry_sweep_secs: 300,
        jwt: JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            access_token_expiry_mins: 15,
        },
    }
}

/// A router over an in-memory engine, plus the engine for direct inspection.
pub struct TestApp {
    pub router: Router,
    pub engine: Arc<NotificationEngine>,
}

/// Build the full application router with all middleware layers over an
/// in-memory notification engine.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let engine = Arc::new(NotificationEngine::in_memory(EngineConfig::default()));
    let state = AppState {
        config: Arc::new(config.clone()),
        engine: Arc::clone(&engine),
    };
    TestApp {
        router: build_app_router(state, &config),
        engine,
    }
}

/// Mint a bearer token accepted by [`test_config`].
pub fn token(user_id: DbId, role: &str) -> String {
    generate_access_token(user_id, role, &test_config().jwt).expect("token generation")
}

pub async fn send(
    app: &TestApp,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &TestApp, uri: &str, bearer: Option<&str>) -> Response<Body> {
    send(app, Method::GET, uri, bearer, None).await
}

pub async fn post(
    app: &TestApp,
    uri: &str,
    bearer: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    send(app, Method::POST, uri, bearer, body).await
}

/// Collect a (finite) response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
