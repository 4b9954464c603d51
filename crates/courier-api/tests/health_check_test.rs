//! Health, readiness and liveness endpoint tests.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState, HttpConfig};
use courier_core::storage::Storage;
use courier_testing::TestEnv;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

fn router(env: &TestEnv) -> Router {
    let state = AppState::new(env.fanout(), env.cache(), env.shared_clock());
    create_router(state, HttpConfig::default())
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    (status, serde_json::from_slice(&body).expect("response should be valid JSON"))
}

#[tokio::test]
async fn health_is_degraded_before_first_snapshot() {
    let env = TestEnv::new().unwrap();

    let (status, body) = get(router(&env), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["subscriptions"]["status"], "down");
    assert!(body["checks"].get("database").is_none());
}

#[tokio::test]
async fn health_is_healthy_once_snapshot_loaded() {
    let env = TestEnv::new().unwrap();
    env.refresh().await.unwrap();

    let (status, body) = get(router(&env), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["checks"]["subscriptions"]["version"], 1);
    assert_eq!(body["checks"]["subscriptions"]["age_seconds"], 0);
}

#[tokio::test]
async fn readiness_waits_for_snapshot() {
    let env = TestEnv::new().unwrap();

    let (status, _) = get(router(&env), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    env.refresh().await.unwrap();

    let (status, _) = get(router(&env), "/ready").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unreachable_database_is_unhealthy() {
    let env = TestEnv::new().unwrap();
    env.refresh().await.unwrap();
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(500))
        .connect_lazy("postgresql://courier@127.0.0.1:1/courier")
        .unwrap();
    let state = AppState::new(env.fanout(), env.cache(), env.shared_clock())
        .with_storage(Arc::new(Storage::new(pool)));

    let (status, body) = get(create_router(state, HttpConfig::default()), "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");
}

#[tokio::test]
async fn liveness_ignores_dependencies() {
    let env = TestEnv::new().unwrap();

    let (status, body) = get(router(&env), "/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "courier");
}

#[tokio::test]
async fn every_response_carries_request_id() {
    let env = TestEnv::new().unwrap();
    let request = Request::builder().uri("/live").body(Body::empty()).unwrap();

    let response = router(&env).oneshot(request).await.unwrap();

    let request_id = response.headers().get("x-request-id").expect("request id header");
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
}

#[tokio::test]
async fn caller_request_id_is_propagated() {
    let env = TestEnv::new().unwrap();
    let request = Request::builder()
        .uri("/live")
        .header("x-request-id", "upstream-7f3a")
        .body(Body::empty())
        .unwrap();

    let response = router(&env).oneshot(request).await.unwrap();

    assert_eq!(response.headers()["x-request-id"], "upstream-7f3a");
}
