//! Processing of leased deliveries.
//!
//! The dispatcher owns one attempt of one delivery: it checks the target's
//! circuit and bulkhead, resolves the payload, performs the HTTP call and
//! settles the lease. It never sleeps waiting for a retry; failed attempts
//! go back to the queue with a delay through the [`RetryManager`].

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{
    Clock, Delivery, DeliveryDeadLetteredEvent, DeliveryEvent, DeliveryPayload,
    DeliveryRetryScheduledEvent, DeliverySucceededEvent, EventHandler, NoOpEventHandler,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    bulkhead::TargetBulkhead,
    circuit::CircuitBreakerManager,
    client::DeliveryClient,
    engine::EngineStats,
    error::{DeliveryError, Result},
    payload::PayloadStore,
    queue::{DispatchQueue, Lease, LeasedDelivery, QueueError},
    retry::{RetryManager, RetryOutcome},
};

/// Default delay before a deferred delivery becomes visible again.
pub const DEFAULT_DEFER_DELAY: Duration = Duration::from_secs(5);

/// Result of processing one leased delivery.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The target answered with a 2xx status.
    Success {
        /// Status returned by the target
        status: u16,
    },
    /// The attempt failed transiently.
    RetryableFailure {
        /// Failure of this attempt
        error: DeliveryError,
        /// Requeued, or dead-lettered when the budget ran out
        retry: RetryOutcome,
    },
    /// The attempt failed permanently and the delivery was dead-lettered.
    PermanentFailure {
        /// Status returned by the target, if it responded
        status: Option<u16>,
        /// Recorded dead-letter reason
        reason: String,
    },
    /// The target was not attempted: its circuit is open or it is saturated.
    Deferred {
        /// Why the attempt was skipped
        reason: String,
        /// Requeued without consuming an attempt, or dead-lettered
        retry: RetryOutcome,
    },
}

impl Outcome {
    /// Whether the delivery reached its terminal success state.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Executes delivery attempts. Shared by every worker of the pool.
pub struct Dispatcher {
    client: Arc<DeliveryClient>,
    payloads: Arc<dyn PayloadStore>,
    queue: Arc<dyn DispatchQueue>,
    retry: Arc<RetryManager>,
    circuits: Arc<CircuitBreakerManager>,
    bulkhead: Arc<TargetBulkhead>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    stats: Arc<RwLock<EngineStats>>,
    defer_delay: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher that discards delivery events.
    pub fn new(
        client: Arc<DeliveryClient>,
        payloads: Arc<dyn PayloadStore>,
        queue: Arc<dyn DispatchQueue>,
        retry: Arc<RetryManager>,
        circuits: Arc<CircuitBreakerManager>,
        bulkhead: Arc<TargetBulkhead>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            payloads,
            queue,
            retry,
            circuits,
            bulkhead,
            clock,
            event_handler: Arc::new(NoOpEventHandler::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            defer_delay: DEFAULT_DEFER_DELAY,
        }
    }

    /// Publishes delivery events to `event_handler`.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Records counters into `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<RwLock<EngineStats>>) -> Self {
        self.stats = stats;
        self
    }

    /// Overrides the delay used for deferred deliveries.
    #[must_use]
    pub fn with_defer_delay(mut self, defer_delay: Duration) -> Self {
        self.defer_delay = defer_delay;
        self
    }

    /// The dispatch queue this dispatcher settles leases on.
    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.queue
    }

    /// Current counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Processes one leased delivery and settles its lease.
    ///
    /// The lease is acked once the outcome is durable: success, a requeued
    /// retry or deferral, or a dead letter.
    ///
    /// # Errors
    ///
    /// Returns error when the retry or dead-letter write fails. The lease is
    /// then nacked so the same attempt is redelivered.
    pub async fn process(&self, leased: LeasedDelivery) -> Result<Outcome> {
        let LeasedDelivery { delivery, lease, receive_count } = leased;

        if receive_count > 1 {
            debug!(
                delivery_id = %delivery.id,
                receive_count,
                "delivery redelivered after lease expiry"
            );
        }

        self.stats.write().await.in_flight_deliveries += 1;
        let result = self.attempt(&delivery).await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries -= 1;
            stats.deliveries_processed += 1;
            if let Ok(outcome) = &result {
                stats.record(outcome);
            }
        }

        match result {
            Ok(outcome) => {
                self.ack(&delivery, lease).await;
                Ok(outcome)
            },
            Err(error) => {
                warn!(
                    delivery_id = %delivery.id,
                    error = %error,
                    "failed to record delivery outcome, releasing lease"
                );
                if let Err(nack_error) = self.queue.nack(lease).await {
                    warn!(delivery_id = %delivery.id, error = %nack_error, "nack failed");
                }
                Err(error)
            },
        }
    }

    async fn ack(&self, delivery: &Delivery, lease: Lease) {
        match self.queue.ack(lease).await {
            Ok(()) => {},
            Err(QueueError::LeaseExpired { .. }) => {
                warn!(
                    delivery_id = %delivery.id,
                    "lease expired before ack, delivery will be processed again"
                );
            },
            Err(error) => {
                warn!(delivery_id = %delivery.id, error = %error, "ack failed");
            },
        }
    }

    async fn attempt(&self, delivery: &Delivery) -> Result<Outcome> {
        if !self.circuits.should_allow_request(delivery.target_id) {
            return self.defer(delivery, DeliveryError::circuit_open(delivery.target_id)).await;
        }

        let _permit = match self.bulkhead.try_acquire(delivery.target_id) {
            Ok(permit) => permit,
            Err(error) => return self.defer(delivery, error).await,
        };

        let attempt_number = delivery.attempt.saturating_add(1);

        let body = match self.resolve_payload(delivery).await {
            Ok(body) => body,
            Err(error) => return self.fail(delivery, error).await,
        };
        let payload_size = body.len();

        debug!(
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            target_id = %delivery.target_id,
            attempt = attempt_number,
            "attempting webhook delivery"
        );

        let result = self
            .client
            .post(delivery, attempt_number, body)
            .await
            .and_then(|response| response.classify(self.clock.now_utc()));

        match result {
            Ok(response) => {
                self.circuits.record_success(delivery.target_id);

                info!(
                    delivery_id = %delivery.id,
                    event_id = %delivery.event_id,
                    status_code = response.status,
                    attempt = attempt_number,
                    duration_ms = response.elapsed.as_millis(),
                    "webhook delivered successfully"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                        delivery_id: delivery.id,
                        event_id: delivery.event_id.clone(),
                        target_id: delivery.target_id,
                        url: delivery.url.clone(),
                        response_status: response.status,
                        attempt_number,
                        payload_size,
                        delivered_at: self.clock.now_utc(),
                    }))
                    .await;

                Ok(Outcome::Success { status: response.status })
            },
            Err(error) => {
                if error.is_target_failure() {
                    self.circuits.record_failure(delivery.target_id);
                } else if error.status_code().is_some() {
                    self.circuits.record_success(delivery.target_id);
                }
                self.fail(delivery, error).await
            },
        }
    }

    async fn resolve_payload(&self, delivery: &Delivery) -> Result<Bytes> {
        match &delivery.payload {
            DeliveryPayload::Inline { data } => Ok(data.clone()),
            DeliveryPayload::Reference { key, .. } => {
                self.payloads.get(key).await.map_err(|e| {
                    DeliveryError::payload(format!("failed to fetch payload {key}: {e}"))
                })
            },
        }
    }

    async fn fail(&self, delivery: &Delivery, error: DeliveryError) -> Result<Outcome> {
        let attempt_number = delivery.attempt.saturating_add(1);

        warn!(
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            target_id = %delivery.target_id,
            attempt = attempt_number,
            error = %error,
            category = %crate::error::ErrorCategory::from(&error),
            "webhook delivery attempt failed"
        );

        if !error.is_retryable() {
            let reason = error.to_string();
            let status = error.status_code();
            let mut attempted = delivery.clone();
            attempted.attempt = attempt_number;

            self.retry.dead_letter(attempted, reason.clone(), status).await?;
            self.publish_dead_lettered(delivery, attempt_number, &reason, status).await;

            return Ok(Outcome::PermanentFailure { status, reason });
        }

        let retry = self.retry.schedule(delivery, &error).await?;

        match &retry {
            RetryOutcome::Requeued { next_attempt_at, .. } => {
                self.event_handler
                    .handle_event(DeliveryEvent::RetryScheduled(DeliveryRetryScheduledEvent {
                        delivery_id: delivery.id,
                        event_id: delivery.event_id.clone(),
                        target_id: delivery.target_id,
                        attempt_number,
                        response_status: error.status_code(),
                        error_message: error.to_string(),
                        next_attempt_at: *next_attempt_at,
                    }))
                    .await;
            },
            RetryOutcome::DeadLettered { reason } => {
                self.publish_dead_lettered(delivery, attempt_number, reason, error.status_code())
                    .await;
            },
        }

        Ok(Outcome::RetryableFailure { error, retry })
    }

    async fn defer(&self, delivery: &Delivery, reason: DeliveryError) -> Result<Outcome> {
        let retry = self.retry.defer(delivery, self.defer_delay).await?;

        debug!(
            delivery_id = %delivery.id,
            target_id = %delivery.target_id,
            reason = %reason,
            delay_ms = self.defer_delay.as_millis(),
            "delivery deferred"
        );

        if let RetryOutcome::DeadLettered { reason } = &retry {
            self.publish_dead_lettered(delivery, delivery.attempt, reason, None).await;
        }

        Ok(Outcome::Deferred { reason: reason.to_string(), retry })
    }

    async fn publish_dead_lettered(
        &self,
        delivery: &Delivery,
        attempts: u32,
        reason: &str,
        last_status: Option<u16>,
    ) {
        self.event_handler
            .handle_event(DeliveryEvent::DeadLettered(DeliveryDeadLetteredEvent {
                delivery_id: delivery.id,
                event_id: delivery.event_id.clone(),
                target_id: delivery.target_id,
                attempts,
                reason: reason.to_string(),
                last_status,
                dead_lettered_at: self.clock.now_utc(),
            }))
            .await;
    }
}
