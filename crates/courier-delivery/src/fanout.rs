//! Event fan-out.
//!
//! Turns one event into one delivery per matching target. Payloads above the
//! inline threshold are stored once and shared by reference among all the
//! deliveries of the event.

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_core::{Clock, Delivery, DeliveryId, DeliveryPayload, WebhookEvent};
use tracing::{debug, info};

use crate::{
    cache::SubscriptionCache,
    delay_from,
    error::{DeliveryError, Result},
    payload::PayloadStore,
    queue::{DispatchQueue, QueueError},
    DEFAULT_INLINE_THRESHOLD,
};

/// Fan-out tuning.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Largest payload carried inline in the queue message.
    pub inline_threshold: usize,
    /// Retry window stamped on every new delivery.
    pub window: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { inline_threshold: DEFAULT_INLINE_THRESHOLD, window: Duration::from_secs(24 * 3600) }
    }
}

/// Fan-out engine. Stateless apart from its adapters, so any number of
/// instances can run side by side.
pub struct FanoutEngine {
    cache: Arc<SubscriptionCache>,
    payloads: Arc<dyn PayloadStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    config: FanoutConfig,
}

impl FanoutEngine {
    /// Creates a fan-out engine.
    pub fn new(
        cache: Arc<SubscriptionCache>,
        payloads: Arc<dyn PayloadStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
        config: FanoutConfig,
    ) -> Self {
        Self { cache, payloads, queue, clock, config }
    }

    /// The engine configuration.
    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Enqueues one delivery per target subscribed to `event.event_type`.
    ///
    /// Several subscriptions binding the same target produce a single
    /// delivery. Returns the enqueued deliveries; an event nobody subscribes
    /// to yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Payload` when offloading the payload fails,
    /// `DeliveryError::MessageTooLarge` when a delivery cannot fit in a queue
    /// message, and `DeliveryError::Queue` when an enqueue fails. Deliveries enqueued
    /// before the failure stay queued; handling the event again is safe
    /// because delivery ids and payload keys are deterministic.
    pub async fn handle(&self, event: &WebhookEvent) -> Result<Vec<Delivery>> {
        let matches = self.cache.lookup(&event.event_type);

        if matches.is_empty() {
            debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "no active subscriptions for event type"
            );
            return Ok(Vec::new());
        }

        let payload = self.place_payload(event).await?;
        let now = self.clock.now_utc();
        let deadline = delay_from(now, self.config.window);

        let mut seen = HashSet::with_capacity(matches.len());
        let mut deliveries = Vec::with_capacity(matches.len());

        for target in matches {
            if !seen.insert(target.target_id) {
                continue;
            }

            let delivery = Delivery {
                id: DeliveryId::derive(&event.event_id, target.target_id),
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                target_id: target.target_id,
                subscription_id: target.subscription_id,
                url: target.url,
                payload: payload.clone(),
                attempt: 0,
                last_delay: Duration::ZERO,
                first_attempt_at: now,
                next_attempt_at: now,
                deadline,
            };

            self.queue.enqueue(&delivery, Duration::ZERO).await.map_err(|e| match e {
                QueueError::MessageTooLarge { size, limit } => {
                    DeliveryError::MessageTooLarge { size, limit }
                },
                e => {
                    DeliveryError::queue(format!("failed to enqueue delivery {}: {e}", delivery.id))
                },
            })?;

            deliveries.push(delivery);
        }

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            deliveries = deliveries.len(),
            payload_size = event.payload.len(),
            inline = payload.is_inline(),
            "event fanned out"
        );

        Ok(deliveries)
    }

    async fn place_payload(&self, event: &WebhookEvent) -> Result<DeliveryPayload> {
        if event.payload.len() <= self.config.inline_threshold {
            return Ok(DeliveryPayload::Inline { data: event.payload.clone() });
        }

        let key = self.payloads.put(event.payload.clone()).await.map_err(|e| {
            DeliveryError::payload(format!("failed to store payload of {}: {e}", event.event_id))
        })?;

        debug!(
            event_id = %event.event_id,
            key = %key,
            size = event.payload.len(),
            "payload offloaded"
        );

        Ok(DeliveryPayload::Reference { key, size: event.payload.len() })
    }
}
