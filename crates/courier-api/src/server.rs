//! Router assembly and serving.
//!
//! Layers, outermost first: request id, `TraceLayer`, `TimeoutLayer`. The
//! ingestion route additionally carries the body limit. Health routes are
//! cheap and share the same stack so every response is traceable by
//! `X-Request-Id`.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use courier_core::{storage::Storage, Clock};
use courier_delivery::{FanoutEngine, SubscriptionCache};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::handlers;

/// Response header carrying the per-request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Fan-out engine that turns ingested events into deliveries.
    pub fanout: Arc<FanoutEngine>,
    /// Subscription cache, consulted for readiness.
    pub cache: Arc<SubscriptionCache>,
    /// Database handle for health checks. `None` when running on in-memory
    /// adapters.
    pub storage: Option<Arc<Storage>>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state without a database.
    pub fn new(
        fanout: Arc<FanoutEngine>,
        cache: Arc<SubscriptionCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { fanout, cache, storage: None, clock }
    }

    /// Attaches the database checked by the health endpoints.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Router-level limits.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_request_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), max_request_bytes: 10 * 1024 * 1024 }
    }
}

/// Builds the service router over `state`.
pub fn create_router(state: AppState, config: HttpConfig) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check));

    let api_routes = Router::new()
        .route("/events", post(handlers::ingest_event))
        .layer(DefaultBodyLimit::max(config.max_request_bytes));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Longest caller-supplied request id that is propagated as is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Propagates the caller's `X-Request-Id`, or mints a UUID when it is absent
/// or unusable, and echoes it on the response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::try_from(Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
        });

    req.headers_mut().insert(REQUEST_ID_HEADER, request_id.clone());
    let mut response = next.run(req).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    response
}

/// Serves `app` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server<F>(app: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server drained");
    Ok(())
}

/// Resolves on CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
