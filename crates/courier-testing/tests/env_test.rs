//! Tests for the test environment itself.

use std::time::Duration;

use courier_core::Clock;
use courier_testing::{EventBuilder, MockEndpoint, MockResponse, TestEnv};

async fn post(url: &str, body: &'static str) -> u16 {
    reqwest::Client::new().post(url).body(body).send().await.unwrap().status().as_u16()
}

#[tokio::test]
async fn subscriptions_are_invisible_until_refresh() {
    let env = TestEnv::new().unwrap();
    env.subscribe("https://t.example/hook", &["order.created"]).await;

    assert!(!env.cache().is_loaded());
    assert!(env.ingest(&EventBuilder::new().build()).await.unwrap().is_empty());

    env.refresh().await.unwrap();

    assert!(env.cache().is_loaded());
    assert_eq!(env.ingest(&EventBuilder::new().build()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_until_idle_drains_an_empty_queue() {
    let env = TestEnv::new().unwrap();

    assert_eq!(env.run_until_idle().await.unwrap(), 0);
}

#[tokio::test]
async fn run_until_idle_advances_through_retries() {
    let endpoint = MockEndpoint::start().await;
    endpoint.sequence(&[MockResponse::Status(503)], MockResponse::Status(200)).await;

    let env = TestEnv::new().unwrap();
    env.subscribe(endpoint.url(), &["order.created"]).await;
    env.refresh().await.unwrap();
    let start = env.clock.now_utc();

    env.ingest(&EventBuilder::new().build()).await.unwrap();
    let processed = env.run_until_idle().await.unwrap();

    assert_eq!(processed, 2);
    assert_eq!(endpoint.request_count().await, 2);
    assert!(env.queue.is_empty().await);
    assert!(env.clock.now_utc() - start >= chrono::Duration::seconds(30));
    assert_eq!(env.events.retries().await, 1);
    assert_eq!(env.events.succeeded().await, 1);
}

#[tokio::test]
async fn mock_endpoint_records_bodies_in_order() {
    let endpoint = MockEndpoint::responding(200).await;

    assert_eq!(post(&endpoint.url(), "first").await, 200);
    assert_eq!(post(&endpoint.url(), "second").await, 200);

    let bodies = endpoint.received_bodies().await;
    assert_eq!(bodies, vec!["first".as_bytes(), "second".as_bytes()]);
}

#[tokio::test]
async fn sequence_then_fallback() {
    let endpoint = MockEndpoint::start().await;
    endpoint
        .sequence(
            &[MockResponse::Status(500), MockResponse::RateLimited { retry_after: Some(5) }],
            MockResponse::Status(204),
        )
        .await;

    assert_eq!(post(&endpoint.url(), "a").await, 500);
    assert_eq!(post(&endpoint.url(), "b").await, 429);
    assert_eq!(post(&endpoint.url(), "c").await, 204);
    assert_eq!(post(&endpoint.url(), "d").await, 204);
}

#[tokio::test]
async fn slow_response_is_delayed() {
    let endpoint = MockEndpoint::start().await;
    endpoint.always(MockResponse::Slow { status: 200, delay: Duration::from_millis(50) }).await;

    let started = std::time::Instant::now();
    post(&endpoint.url(), "x").await;

    assert!(started.elapsed() >= Duration::from_millis(50));
}
