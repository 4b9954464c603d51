//! Outbound HTTP to webhook targets.
//!
//! Sends the raw payload to the target URL with the deduplication headers
//! receivers use to drop repeated deliveries, and classifies the response
//! for the retry manager and the circuit breaker.

use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::Delivery;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the producer event id.
pub const EVENT_ID_HEADER: &str = "X-Courier-Event-Id";
/// Header carrying the deterministic delivery id.
pub const DELIVERY_ID_HEADER: &str = "X-Courier-Delivery-Id";
/// Header carrying the 1-based attempt number.
pub const DELIVERY_ATTEMPT_HEADER: &str = "X-Courier-Delivery-Attempt";
/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "X-Courier-Event-Type";

/// Bytes of a response body kept for error messages.
const BODY_EXCERPT_BYTES: usize = 512;

/// Delay assumed when a 429 carries a `Retry-After` we cannot parse.
const UNPARSABLE_RETRY_AFTER_SECS: u64 = 60;

/// Settings for outbound delivery calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single HTTP call, connect through body.
    pub timeout: Duration,
    /// `User-Agent` header sent to targets.
    pub user_agent: String,
    /// Content type sent with every payload.
    pub content_type: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            content_type: "application/json".to_string(),
        }
    }
}

/// HTTP client shared by all dispatcher workers.
///
/// Wraps a pooled `reqwest::Client`. Redirects are not followed: a target
/// that moved answers 3xx, which counts as a server error and is retried.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    config: ClientConfig,
}

/// What a target answered.
#[derive(Debug, Clone)]
pub struct TargetResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Retry-After` header value, if present.
    pub retry_after: Option<String>,
    /// Leading bytes of the response body.
    pub body_excerpt: String,
    /// Time from sending the request to reading the body.
    pub elapsed: Duration,
}

impl TargetResponse {
    /// Maps the response onto a delivery outcome.
    ///
    /// 2xx is success. 429 is a retryable rate limit carrying any
    /// `Retry-After` guidance, 408 a retryable client error. Other 4xx are
    /// permanent. 5xx and anything unexpected are retryable server errors.
    ///
    /// # Errors
    ///
    /// Returns the categorized `DeliveryError` for every non-2xx status.
    pub fn classify(self, now: DateTime<Utc>) -> Result<Self> {
        match self.status {
            200..=299 => Ok(self),
            429 => Err(DeliveryError::rate_limited(
                self.retry_after.as_deref().map(|value| parse_retry_after(value, now)),
            )),
            400..=499 => Err(DeliveryError::client_error(self.status, self.body_excerpt)),
            _ => Err(DeliveryError::server_error(self.status, self.body_excerpt)),
        }
    }
}

impl DeliveryClient {
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the underlying HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { http, config })
    }

    /// Client with [`ClientConfig::default`].
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs `body` to the delivery's target as attempt number `attempt`.
    ///
    /// Every HTTP answer, 4xx and 5xx included, comes back as `Ok`; call
    /// [`TargetResponse::classify`] to turn it into an outcome.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` when the URL is not an absolute HTTP(S) URL
    /// - `Timeout` when the call exceeds the configured timeout
    /// - `NetworkError` for connection and transport failures
    pub async fn post(
        &self,
        delivery: &Delivery,
        attempt: u32,
        body: Bytes,
    ) -> Result<TargetResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            target_id = %delivery.target_id,
            attempt
        );

        async move {
            let url = validate_url(&delivery.url)?;
            let started = Instant::now();

            let sent = self
                .http
                .post(url)
                .header("content-type", &self.config.content_type)
                .header(EVENT_ID_HEADER, delivery.event_id.as_str())
                .header(DELIVERY_ID_HEADER, delivery.id.to_string())
                .header(DELIVERY_ATTEMPT_HEADER, attempt.to_string())
                .header(EVENT_TYPE_HEADER, &delivery.event_type)
                .body(body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    warn!(elapsed_ms = started.elapsed().as_millis(), error = %e, "request failed");
                    return Err(if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    });
                },
            };

            let status = response.status().as_u16();
            let retry_after = header_value(response.headers());
            let body_excerpt = match response.bytes().await {
                Ok(bytes) => excerpt(&bytes),
                Err(e) => format!("[unreadable response body: {e}]"),
            };
            let elapsed = started.elapsed();

            debug!(status, elapsed_ms = elapsed.as_millis(), "target responded");
            Ok(TargetResponse { status, retry_after, body_excerpt, elapsed })
        }
        .instrument(span)
        .await
    }
}

fn validate_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw)
        .map_err(|e| DeliveryError::configuration(format!("invalid target URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DeliveryError::configuration(format!(
            "unsupported target URL scheme '{scheme}'"
        ))),
    }
}

fn header_value(headers: &HeaderMap) -> Option<String> {
    headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn excerpt(bytes: &[u8]) -> String {
    if bytes.len() <= BODY_EXCERPT_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..BODY_EXCERPT_BYTES]))
}

/// Seconds to wait according to a `Retry-After` value.
///
/// Accepts delta-seconds or an HTTP date; a date in the past yields zero and
/// anything else falls back to 60 seconds.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> u64 {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    match DateTime::parse_from_rfc2822(value) {
        Ok(at) => (at.with_timezone(&Utc) - now).to_std().map_or(0, |delay| delay.as_secs()),
        Err(_) => UNPARSABLE_RETRY_AFTER_SECS,
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{DeliveryId, DeliveryPayload, EventId, TargetId};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn delivery_to(url: String) -> Delivery {
        let event_id = EventId::from("evt_client");
        let target_id = TargetId::new();
        let now = Utc::now();
        Delivery {
            id: DeliveryId::derive(&event_id, target_id),
            event_id,
            event_type: "order.created".to_string(),
            target_id,
            subscription_id: courier_core::SubscriptionId::new(),
            url,
            payload: DeliveryPayload::Inline { data: Bytes::from_static(b"{}") },
            attempt: 0,
            last_delay: Duration::ZERO,
            first_attempt_at: now,
            next_attempt_at: now,
            deadline: now + chrono::Duration::hours(24),
        }
    }

    fn answered(status: u16, retry_after: Option<&str>) -> TargetResponse {
        TargetResponse {
            status,
            retry_after: retry_after.map(str::to_string),
            body_excerpt: String::new(),
            elapsed: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn payload_and_dedup_headers_reach_target() {
        let server = MockServer::start().await;
        let delivery = delivery_to(format!("{}/hook", server.uri()));

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::body_string("{\"total\":3}"))
            .and(matchers::header(EVENT_ID_HEADER, "evt_client"))
            .and(matchers::header(DELIVERY_ID_HEADER, delivery.id.to_string().as_str()))
            .and(matchers::header(DELIVERY_ATTEMPT_HEADER, "2"))
            .and(matchers::header(EVENT_TYPE_HEADER, "order.created"))
            .and(matchers::header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.post(&delivery, 2, Bytes::from("{\"total\":3}")).await.unwrap();

        assert_eq!(response.status, 204);
    }

    #[tokio::test]
    async fn error_statuses_are_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "15")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.post(&delivery_to(server.uri()), 1, Bytes::new()).await.unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after.as_deref(), Some("15"));
        assert_eq!(response.body_excerpt, "slow down");
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.post(&delivery_to(server.uri()), 1, Bytes::new()).await.unwrap();

        assert!(matches!(
            response.classify(Utc::now()),
            Err(DeliveryError::ServerError { status_code: 301, .. })
        ));
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();

        let result = client.post(&delivery_to(server.uri()), 1, Bytes::new()).await;
        assert!(matches!(result, Err(DeliveryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn invalid_url_is_a_configuration_error() {
        let client = DeliveryClient::with_defaults().unwrap();

        for url in ["not a url", "ftp://example.com/x"] {
            let result = client.post(&delivery_to(url.to_string()), 1, Bytes::new()).await;
            assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })), "{url}");
        }
    }

    #[test]
    fn classification_follows_status_families() {
        let now = Utc::now();

        assert!(answered(200, None).classify(now).is_ok());
        assert!(matches!(
            answered(410, None).classify(now),
            Err(DeliveryError::ClientError { status_code: 410, .. })
        ));
        assert!(matches!(
            answered(503, None).classify(now),
            Err(DeliveryError::ServerError { status_code: 503, .. })
        ));
        assert!(matches!(
            answered(429, Some("90")).classify(now),
            Err(DeliveryError::RateLimited { retry_after_seconds: Some(90) })
        ));
        assert!(matches!(
            answered(429, None).classify(now),
            Err(DeliveryError::RateLimited { retry_after_seconds: None })
        ));
        assert!(answered(408, None).classify(now).unwrap_err().is_retryable());
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(parse_retry_after(" 120 ", now), 120);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:30:00 GMT", now), 120);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), 0);
        assert_eq!(parse_retry_after("soon", now), 60);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = vec![b'x'; BODY_EXCERPT_BYTES * 2];

        let kept = excerpt(&body);

        assert!(kept.ends_with("... (truncated)"));
        assert_eq!(kept.len(), BODY_EXCERPT_BYTES + "... (truncated)".len());
    }
}
