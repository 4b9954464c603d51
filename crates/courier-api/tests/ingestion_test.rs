//! Event ingestion endpoint tests.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, handlers::ingest::IngestResponse, AppState, HttpConfig};
use courier_core::{DeliveryId, DeliveryPayload, EventId};
use courier_testing::{EventBuilder, TestEnv};
use serde_json::Value;
use tower::ServiceExt;

fn router(env: &TestEnv) -> Router {
    let state = AppState::new(env.fanout(), env.cache(), env.shared_clock());
    create_router(state, HttpConfig::default())
}

fn post_events(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).expect("response should be valid JSON"))
}

async fn ready_env(targets: usize) -> TestEnv {
    let env = TestEnv::new().unwrap();
    for n in 0..targets {
        env.subscribe(format!("https://t{n}.example/hook"), &["order.created"]).await;
    }
    env.refresh().await.unwrap();
    env
}

#[tokio::test]
async fn event_is_fanned_out_and_accepted() {
    let env = ready_env(3).await;
    let event = EventBuilder::new().id("evt_123");

    let (status, body) = send(router(&env), post_events(event.envelope().to_string())).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let response: IngestResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.event_id, "evt_123");
    assert_eq!(response.deliveries, 3);
    assert_eq!(env.queue.len().await, 3);
}

#[tokio::test]
async fn payload_string_is_delivered_verbatim() {
    let env = ready_env(1).await;
    let event = EventBuilder::new().id("evt_1").payload(r#"{"total": 12.5}"#);

    send(router(&env), post_events(event.envelope().to_string())).await;

    let queued = env.queue.deliveries().await;
    assert_eq!(queued.len(), 1);
    let DeliveryPayload::Inline { data } = &queued[0].payload else {
        panic!("small payload should be inline");
    };
    assert_eq!(&data[..], br#"{"total": 12.5}"#);
}

#[tokio::test]
async fn event_id_falls_back_to_header() {
    let env = ready_env(1).await;
    let envelope = EventBuilder::new().without_id().envelope().to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/events")
        .header("x-event-id", "evt_from_header")
        .body(Body::from(envelope))
        .unwrap();

    let (status, body) = send(router(&env), request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["event_id"], "evt_from_header");
}

#[tokio::test]
async fn event_id_is_generated_when_absent() {
    let env = ready_env(1).await;
    let envelope = EventBuilder::new().without_id().envelope().to_string();

    let (status, body) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let event_id = body["event_id"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(event_id).is_ok());
}

#[tokio::test]
async fn resubmitting_an_event_keeps_delivery_ids() {
    let env = ready_env(1).await;
    let envelope = EventBuilder::new().id("evt_dup").envelope().to_string();

    send(router(&env), post_events(envelope.clone())).await;
    send(router(&env), post_events(envelope)).await;

    let ids: Vec<DeliveryId> = env.queue.deliveries().await.iter().map(|d| d.id).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
    let target_id = env.queue.deliveries().await[0].target_id;
    assert_eq!(ids[0], DeliveryId::derive(&EventId::from("evt_dup"), target_id));
}

#[tokio::test]
async fn unmatched_event_is_accepted_with_no_deliveries() {
    let env = ready_env(2).await;
    let envelope = EventBuilder::new().event_type("nobody.listens").envelope().to_string();

    let (status, body) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deliveries"], 0);
    assert!(env.queue.is_empty().await);
}

#[tokio::test]
async fn malformed_envelope_is_rejected() {
    let env = ready_env(1).await;

    for body in [
        "not json",
        r#"{"payload":"x"}"#,
        r#"{"event_type":"order.created"}"#,
        r#"{"event_type":"order.created","payload":{"nested":true}}"#,
        r#"{"event_type":"  ","payload":"x"}"#,
    ] {
        let (status, response) = send(router(&env), post_events(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(response["error"]["code"], "invalid_envelope");
    }
    assert!(env.queue.is_empty().await);
}

#[tokio::test]
async fn ingestion_waits_for_first_snapshot() {
    let env = TestEnv::new().unwrap();
    env.subscribe("https://t.example/hook", &["order.created"]).await;
    let envelope = EventBuilder::new().envelope().to_string();

    let (status, body) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "not_ready");
}

#[tokio::test]
async fn queue_failure_asks_the_caller_to_retry() {
    let env = ready_env(1).await;
    env.queue.fail_next_enqueue("queue unavailable").await;
    let envelope = EventBuilder::new().envelope().to_string();

    let (status, body) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "fanout_failed");
}

#[tokio::test]
async fn payload_store_failure_asks_the_caller_to_retry() {
    let env = TestEnv::builder().inline_threshold(16).build().unwrap();
    env.subscribe("https://t.example/hook", &["order.created"]).await;
    env.refresh().await.unwrap();
    env.payloads.fail_next_put("blob store down").await;
    let envelope = EventBuilder::new().payload_size(64).envelope().to_string();

    let (status, _) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(env.queue.is_empty().await);
}

#[tokio::test]
async fn large_payload_within_body_limit_is_accepted() {
    let env = ready_env(1).await;
    let envelope = EventBuilder::new().payload_size(2 * 1024 * 1024).envelope().to_string();

    let (status, _) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let queued = env.queue.deliveries().await;
    assert!(matches!(
        queued[0].payload,
        DeliveryPayload::Reference { size, .. } if size == 2 * 1024 * 1024
    ));
}

#[tokio::test]
async fn event_too_large_for_the_queue_is_not_retryable() {
    let env = TestEnv::new().unwrap();
    let event_type = "order.".repeat(64 * 1024);
    env.subscribe("https://t.example/hook", &[event_type.as_str()]).await;
    env.refresh().await.unwrap();
    let envelope = EventBuilder::new().event_type(event_type.as_str()).envelope().to_string();

    let (status, body) = send(router(&env), post_events(envelope)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "event_too_large");
    assert!(env.queue.is_empty().await);
}
