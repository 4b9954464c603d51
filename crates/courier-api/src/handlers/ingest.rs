//! Event ingestion handler.
//!
//! Accepts an event envelope, fans it out to every subscribed target, and
//! answers once all deliveries are durably enqueued. A 503 tells the caller
//! to retry; handling the same event again is idempotent as long as the
//! caller supplies its event id. A 413 means the event can never be queued
//! and must not be retried.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use courier_core::{EventId, WebhookEvent};
use courier_delivery::{error::ErrorCategory, DeliveryError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::AppState;

/// Header consulted for the event id when the envelope carries none.
pub const EVENT_ID_HEADER: &str = "x-event-id";

/// Event envelope accepted by `POST /events`.
///
/// The UTF-8 bytes of `payload` are delivered verbatim to every target.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// Event type matched against subscription filters.
    pub event_type: String,
    /// Raw payload.
    pub payload: String,
    /// Caller-supplied identifier used for delivery deduplication.
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Response from successful ingestion.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Identifier of the ingested event
    pub event_id: String,
    /// Number of deliveries enqueued
    pub deliveries: usize,
}

/// Error response with code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Ingests an event for fan-out.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Malformed envelope or empty event type
/// - 413: A delivery of the event would not fit in a queue message
/// - 503: Subscriptions not loaded yet, or fan-out failed
#[instrument(
    name = "ingest_event",
    skip(state, headers, body),
    fields(content_length = body.len())
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: IngestRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected malformed event envelope");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_envelope",
                format!("malformed event envelope: {e}"),
            );
        },
    };

    if request.event_type.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_envelope",
            "event_type must not be empty".to_string(),
        );
    }

    if !state.cache.is_loaded() {
        warn!("Rejected event before the first subscription snapshot loaded");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "subscriptions are not loaded yet".to_string(),
        );
    }

    let event_id = resolve_event_id(request.event_id, &headers);
    let event = WebhookEvent::new(event_id, request.event_type, request.payload);
    debug!(event_id = %event.event_id, event_type = %event.event_type, "Event accepted");

    match state.fanout.handle(&event).await {
        Ok(deliveries) => {
            info!(
                event_id = %event.event_id,
                deliveries = deliveries.len(),
                "Event ingested"
            );
            (
                StatusCode::ACCEPTED,
                Json(IngestResponse {
                    event_id: event.event_id.to_string(),
                    deliveries: deliveries.len(),
                }),
            )
                .into_response()
        },
        Err(e) => fanout_failure(&event, &e),
    }
}

/// Envelope id first, then the `X-Event-Id` header, then a fresh id.
fn resolve_event_id(from_envelope: Option<String>, headers: &HeaderMap) -> EventId {
    from_envelope
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            headers
                .get(EVENT_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string)
        })
        .map_or_else(EventId::generate, EventId::from)
}

fn fanout_failure(event: &WebhookEvent, e: &DeliveryError) -> Response {
    let category = ErrorCategory::from(e);
    error!(
        event_id = %event.event_id,
        error = %e,
        category = %category,
        "Fan-out failed"
    );

    match e {
        DeliveryError::MessageTooLarge { .. } => {
            error_response(StatusCode::PAYLOAD_TOO_LARGE, "event_too_large", e.to_string())
        },
        _ => error_response(StatusCode::SERVICE_UNAVAILABLE, "fanout_failed", e.to_string()),
    }
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(ErrorResponse { error: ErrorDetail { code: code.to_string(), message } }))
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn envelope_id_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_ID_HEADER, HeaderValue::from_static("from-header"));

        let id = resolve_event_id(Some("from-envelope".to_string()), &headers);

        assert_eq!(id.as_str(), "from-envelope");
    }

    #[test]
    fn header_id_used_when_envelope_has_none() {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_ID_HEADER, HeaderValue::from_static("from-header"));

        assert_eq!(resolve_event_id(None, &headers).as_str(), "from-header");
        assert_eq!(resolve_event_id(Some("  ".to_string()), &headers).as_str(), "from-header");
    }

    #[test]
    fn missing_id_is_generated() {
        let a = resolve_event_id(None, &HeaderMap::new());
        let b = resolve_event_id(None, &HeaderMap::new());

        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn envelope_event_id_is_optional() {
        let request: IngestRequest =
            serde_json::from_str(r#"{"event_type":"order.created","payload":"{}"}"#).unwrap();

        assert_eq!(request.event_type, "order.created");
        assert!(request.event_id.is_none());
    }
}
