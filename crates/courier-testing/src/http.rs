//! Mock webhook targets built on `wiremock`.

use std::time::Duration;

use bytes::Bytes;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Path every mock target listens on.
pub const HOOK_PATH: &str = "/hook";

/// Response a mock target returns.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Plain status with an empty body.
    Status(u16),
    /// 429 with an optional `Retry-After` in seconds.
    RateLimited {
        /// Value of the `Retry-After` header.
        retry_after: Option<u64>,
    },
    /// Status returned after a delay.
    Slow {
        /// Status code.
        status: u16,
        /// Delay before responding.
        delay: Duration,
    },
}

impl MockResponse {
    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Status(status) => ResponseTemplate::new(*status),
            Self::RateLimited { retry_after } => {
                let template = ResponseTemplate::new(429);
                match retry_after {
                    Some(seconds) => template.insert_header("Retry-After", seconds.to_string()),
                    None => template,
                }
            },
            Self::Slow { status, delay } => ResponseTemplate::new(*status).set_delay(*delay),
        }
    }
}

/// A webhook target backed by a local mock server.
pub struct MockEndpoint {
    server: MockServer,
}

impl MockEndpoint {
    /// Starts a target with no responses mounted.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Starts a target answering every POST with `status`.
    pub async fn responding(status: u16) -> Self {
        let endpoint = Self::start().await;
        endpoint.always(MockResponse::Status(status)).await;
        endpoint
    }

    /// URL deliveries should be posted to.
    pub fn url(&self) -> String {
        format!("{}{HOOK_PATH}", self.server.uri())
    }

    /// Answers every remaining request with `response`.
    pub async fn always(&self, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers the next `times` requests with `response`, ahead of anything
    /// mounted later.
    pub async fn next(&self, times: u64, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(response.template())
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Answers requests with `responses` in order, then with `then` forever.
    pub async fn sequence(&self, responses: &[MockResponse], then: MockResponse) {
        for response in responses {
            self.next(1, response.clone()).await;
        }
        self.always(then).await;
    }

    /// Number of webhook POSTs received so far.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Bodies of the webhook POSTs received so far, in arrival order.
    pub async fn received_bodies(&self) -> Vec<Bytes> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| Bytes::from(request.body))
            .collect()
    }

    /// Value of `header` on every received request.
    pub async fn received_header(&self, header: &str) -> Vec<Option<String>> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| {
                request.headers.get(header).and_then(|v| v.to_str().ok()).map(str::to_string)
            })
            .collect()
    }

    /// The underlying mock server.
    pub fn server(&self) -> &MockServer {
        &self.server
    }
}
