//! Health, readiness and liveness endpoints.
//!
//! Readiness requires a loaded subscription snapshot and, when a database is
//! attached, a reachable database. Liveness touches nothing external.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{storage::Storage, Clock};
use courier_delivery::SubscriptionCache;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::AppState;

/// Body of `/health` and `/ready`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Worst verdict across the checks.
    pub status: HealthStatus,
    /// When the checks ran.
    pub timestamp: DateTime<Utc>,
    /// Per-dependency results.
    pub checks: HealthChecks,
    /// Crate version of the running binary.
    pub version: &'static str,
}

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every dependency is up
    Healthy,
    /// Serving, but the subscription snapshot has not loaded yet
    Degraded,
    /// The database is unreachable
    Unhealthy,
}

/// Results of the individual dependency checks.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Absent when running without a database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseCheck>,
    /// Subscription snapshot state.
    pub subscriptions: SnapshotCheck,
}

/// Up or down, per dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Reachable or loaded
    Up,
    /// Unreachable or not yet loaded
    Down,
}

/// Outcome of a round-trip query against the database.
#[derive(Debug, Serialize)]
pub struct DatabaseCheck {
    /// Whether the query succeeded.
    pub status: ComponentStatus,
    /// Round-trip time of the check query.
    pub latency_ms: u64,
    /// Driver error when the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of the in-memory subscription snapshot.
#[derive(Debug, Serialize)]
pub struct SnapshotCheck {
    /// Up once a snapshot has loaded.
    pub status: ComponentStatus,
    /// Zero until the first successful load.
    pub version: u64,
    /// Seconds since the snapshot was loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
    /// Distinct event types with at least one subscriber.
    pub event_types: usize,
}

/// Runs the dependency checks against a clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a service that timestamps checks with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the database (when attached) and the subscription snapshot.
    ///
    /// An unreachable database makes the service unhealthy; a missing
    /// snapshot only degrades it, since the refresher keeps retrying.
    pub async fn health_check(
        &self,
        storage: Option<&Storage>,
        cache: &SubscriptionCache,
    ) -> HealthResponse {
        let database = match storage {
            Some(storage) => Some(self.check_database(storage).await),
            None => None,
        };
        let subscriptions = self.inspect_snapshot(cache);

        let database_down = database.as_ref().is_some_and(|db| db.status == ComponentStatus::Down);
        let status = if database_down {
            HealthStatus::Unhealthy
        } else if subscriptions.status == ComponentStatus::Down {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthResponse {
            status,
            timestamp: self.clock.now_utc(),
            checks: HealthChecks { database, subscriptions },
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    async fn check_database(&self, storage: &Storage) -> DatabaseCheck {
        let started = self.clock.now();
        let result = storage.health_check().await;
        let latency_ms =
            u64::try_from(self.clock.now().duration_since(started).as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => DatabaseCheck { status: ComponentStatus::Up, latency_ms, error: None },
            Err(e) => {
                warn!(error = %e, latency_ms, "database health check failed");
                DatabaseCheck {
                    status: ComponentStatus::Down,
                    latency_ms,
                    error: Some(e.to_string()),
                }
            },
        }
    }

    fn inspect_snapshot(&self, cache: &SubscriptionCache) -> SnapshotCheck {
        let snapshot = cache.snapshot();
        let status = if cache.is_loaded() { ComponentStatus::Up } else { ComponentStatus::Down };

        SnapshotCheck {
            status,
            version: snapshot.version,
            age_seconds: snapshot.built_at.map(|at| (self.clock.now_utc() - at).num_seconds()),
            event_types: snapshot.event_type_count(),
        }
    }
}

async fn evaluate(state: &AppState) -> HealthResponse {
    HealthService::new(state.clock.clone())
        .health_check(state.storage.as_deref(), &state.cache)
        .await
}

/// `GET /health`. Degraded still answers 200.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let response = evaluate(&app_state).await;
    debug!(status = ?response.status, "health evaluated");

    let code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(response)).into_response()
}

/// `GET /ready`. 200 only when every check is up, so ingestion is not routed
/// here before the first subscription snapshot.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    let response = evaluate(&app_state).await;

    let code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(response)).into_response()
}

/// `GET /live`.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "courier"
    });

    (StatusCode::OK, Json(body)).into_response()
}
