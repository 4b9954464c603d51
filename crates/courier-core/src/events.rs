//! Delivery lifecycle notifications.
//!
//! The dispatcher publishes a [`DeliveryEvent`] whenever a delivery reaches
//! a lifecycle edge. Observers implement [`EventHandler`]; handlers never
//! influence the delivery itself.
//!
//! ```text
//!                 Succeeded / RetryScheduled / DeadLettered
//! ┌──────────────┐                                  ┌─────────────────────┐
//! │  Dispatcher  │ ───────────────────────────────▶ │ dyn EventHandler    │
//! └──────────────┘                                  │ (tracing, recorder) │
//!                                                   └─────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryId, EventId, TargetId};

/// A delivery reached a lifecycle edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// The target acknowledged the delivery with a 2xx response.
    Succeeded(DeliverySucceededEvent),

    /// The attempt failed transiently and a retry was enqueued.
    RetryScheduled(DeliveryRetryScheduledEvent),

    /// The delivery reached the dead-letter sink.
    DeadLettered(DeliveryDeadLetteredEvent),
}

impl DeliveryEvent {
    /// Identity of the delivery this event concerns.
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            Self::Succeeded(event) => event.delivery_id,
            Self::RetryScheduled(event) => event.delivery_id,
            Self::DeadLettered(event) => event.delivery_id,
        }
    }
}

/// The target accepted the delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivery identity.
    pub delivery_id: DeliveryId,
    /// Event that was delivered.
    pub event_id: EventId,
    /// Target that received the webhook.
    pub target_id: TargetId,
    /// URL the webhook was posted to.
    pub url: String,
    /// HTTP status returned by the target.
    pub response_status: u16,
    /// Attempt number that succeeded (1-based).
    pub attempt_number: u32,
    /// Bytes posted.
    pub payload_size: usize,
    /// When the delivery succeeded.
    pub delivered_at: DateTime<Utc>,
}

/// Event emitted when a failed attempt is rescheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRetryScheduledEvent {
    /// Delivery identity.
    pub delivery_id: DeliveryId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Target being attempted.
    pub target_id: TargetId,
    /// Attempt number that failed (1-based).
    pub attempt_number: u32,
    /// HTTP status of the failed attempt, if the target responded.
    pub response_status: Option<u16>,
    /// Error that caused the failure.
    pub error_message: String,
    /// When the next attempt becomes eligible.
    pub next_attempt_at: DateTime<Utc>,
}

/// Event emitted when a delivery is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDeadLetteredEvent {
    /// Delivery identity.
    pub delivery_id: DeliveryId,
    /// Event that could not be delivered.
    pub event_id: EventId,
    /// Target that could not be reached.
    pub target_id: TargetId,
    /// Number of attempts made.
    pub attempts: u32,
    /// Why the delivery was abandoned.
    pub reason: String,
    /// Last HTTP status received, if any.
    pub last_status: Option<u16>,
    /// When the delivery was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Observer of delivery lifecycle events.
///
/// Called inline by the dispatcher after the outcome is settled, so a slow
/// handler slows delivery. Handlers swallow their own failures.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Fans one event out to several handlers, awaiting them together.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` to the fan-out list.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<Arc<dyn EventHandler>> for MulticastEventHandler {
    fn from_iter<I: IntoIterator<Item = Arc<dyn EventHandler>>>(iter: I) -> Self {
        Self { handlers: iter.into_iter().collect() }
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        futures::future::join_all(
            self.handlers.iter().map(|handler| handler.handle_event(event.clone())),
        )
        .await;
    }
}

/// Logs every event through `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match &event {
            DeliveryEvent::Succeeded(e) => tracing::debug!(
                delivery_id = %e.delivery_id,
                event_id = %e.event_id,
                status = e.response_status,
                attempt = e.attempt_number,
                "delivery succeeded"
            ),
            DeliveryEvent::RetryScheduled(e) => tracing::debug!(
                delivery_id = %e.delivery_id,
                event_id = %e.event_id,
                attempt = e.attempt_number,
                next_attempt_at = %e.next_attempt_at,
                "delivery retry scheduled"
            ),
            DeliveryEvent::DeadLettered(e) => tracing::debug!(
                delivery_id = %e.delivery_id,
                event_id = %e.event_id,
                attempts = e.attempts,
                reason = %e.reason,
                "delivery dead-lettered"
            ),
        }
    }
}
