//! Backoff scheduling and dead-lettering.
//!
//! A failed attempt never sleeps in the dispatcher. Instead the retry
//! manager computes the next delay and re-enqueues the delivery with that
//! delay, letting the queue's delayed visibility drive the state machine:
//!
//! ```text
//!  Pending ──receive──▶ InFlight ──2xx──▶ Succeeded
//!     ▲                    │
//!     │                    ├──retryable──▶ Retrying ──enqueue(delay)──┐
//!     │                    │                   │                      │
//!     └────────────────────┼───────────────────┼──────────────────────┘
//!                          │                   └─window exhausted─┐
//!                          └──permanent────────────────────────────▶ DeadLettered
//! ```
//!
//! Delays are non-decreasing in the attempt number. Jitter is drawn from
//! `[0, jitter_factor * (raw(n + 1) - raw(n))]`, which spreads retries
//! without ever letting attempt `n` wait longer than attempt `n + 1`. A
//! `Retry-After` that raised one delay also floors every later one, through
//! [`Delivery::last_delay`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, DeadLetter, Delivery};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    dead_letter::DeadLetterSink,
    delay_from,
    error::{DeliveryError, Result},
    queue::DispatchQueue,
};

/// Reason recorded when the retry window runs out.
pub const WINDOW_EXHAUSTED: &str = "window exhausted";

/// Retry policy configuration for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,

    /// Fraction (0.0 to 1.0) of the gap to the next raw delay used as
    /// jitter range.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,

    /// Total time a delivery may spend retrying, measured from its first
    /// attempt.
    pub window: Duration,

    /// Optional cap on attempts, on top of the window.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
            window: Duration::from_secs(24 * 3600),
            max_attempts: None,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter or cap.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => {
                self.base_delay.checked_mul(attempt).unwrap_or(Duration::MAX)
            },
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(20);
                self.base_delay.checked_mul(1 << exponent).unwrap_or(Duration::MAX)
            },
        }
    }

    /// Upper bound of the jitter added to retry number `attempt`.
    pub fn jitter_bound(&self, attempt: u32) -> Duration {
        let gap = self.raw_delay(attempt + 1).saturating_sub(self.raw_delay(attempt));
        gap.mul_f64(self.jitter_factor.clamp(0.0, 1.0))
    }

    /// Delay before retry number `attempt`, jittered and capped.
    ///
    /// A target-supplied `retry_after` raises the delay but never past
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jittered = apply_jitter(self.raw_delay(attempt), self.jitter_bound(attempt));
        let delay = jittered.min(self.max_delay);

        match retry_after {
            Some(requested) => delay.max(requested.min(self.max_delay)),
            None => delay,
        }
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Number of attempts made so far, including the failed one.
    pub attempt_number: u32,
    /// Error that caused the delivery failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// When the delivery was first attempted.
    pub first_attempt_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
    /// Delay applied before the failed attempt; the next one is at least
    /// this long.
    pub previous_delay: Duration,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery after `delay`.
    Retry {
        /// Delay before the next attempt
        delay: Duration,
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry - delivery permanently failed.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        first_attempt_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            attempt_number,
            error,
            failed_at,
            first_attempt_at,
            policy,
            previous_delay: Duration::ZERO,
        }
    }

    /// Floors the next delay at `delay`.
    #[must_use]
    pub fn with_previous_delay(mut self, delay: Duration) -> Self {
        self.previous_delay = delay;
        self
    }

    /// Determines if and when to retry.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if let Some(max_attempts) = self.policy.max_attempts {
            if self.attempt_number >= max_attempts {
                return RetryDecision::GiveUp {
                    reason: format!("maximum attempts ({max_attempts}) exceeded"),
                };
            }
        }

        let retry_after = self.error.retry_after_seconds().map(Duration::from_secs);
        let delay = self
            .policy
            .delay_for_attempt(self.attempt_number, retry_after)
            .max(self.previous_delay);
        let next_attempt_at = delay_from(self.failed_at, delay);

        if !within_window(self.first_attempt_at, next_attempt_at, self.policy.window) {
            return RetryDecision::GiveUp { reason: WINDOW_EXHAUSTED.to_string() };
        }

        RetryDecision::Retry { delay, next_attempt_at }
    }
}

fn within_window(first_attempt_at: DateTime<Utc>, at: DateTime<Utc>, window: Duration) -> bool {
    (at - first_attempt_at).to_std().map_or(true, |elapsed| elapsed <= window)
}

/// Adds a uniformly drawn jitter in `[0, bound]` to `duration`.
fn apply_jitter(duration: Duration, bound: Duration) -> Duration {
    if bound.is_zero() {
        return duration;
    }

    let mut rng = rand::rng();
    let jitter = rng.random_range(0.0..=bound.as_secs_f64());
    duration.saturating_add(Duration::from_secs_f64(jitter))
}

/// What the retry manager did with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The delivery was re-enqueued.
    Requeued {
        /// Attempt count carried by the re-enqueued delivery
        attempt: u32,
        /// Delay before it becomes visible
        delay: Duration,
        /// When it becomes visible
        next_attempt_at: DateTime<Utc>,
    },
    /// The delivery was handed to the dead-letter sink.
    DeadLettered {
        /// Recorded reason
        reason: String,
    },
}

/// Schedules retries through the dispatch queue and dead-letters deliveries
/// that run out of budget.
pub struct RetryManager {
    queue: Arc<dyn DispatchQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    /// Creates a retry manager.
    pub fn new(
        queue: Arc<dyn DispatchQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, dead_letters, policy, clock }
    }

    /// The policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a failed attempt of `delivery`.
    ///
    /// Increments the attempt count, then either re-enqueues the delivery
    /// with the backoff delay or dead-letters it.
    ///
    /// # Errors
    ///
    /// Returns error if the enqueue or the dead-letter write fails. The
    /// caller must then leave the original message to be redelivered.
    pub async fn schedule(
        &self,
        delivery: &Delivery,
        error: &DeliveryError,
    ) -> Result<RetryOutcome> {
        let now = self.clock.now_utc();
        let attempt = delivery.attempt.saturating_add(1);
        let context = RetryContext::new(
            attempt,
            error.clone(),
            now,
            delivery.first_attempt_at,
            self.policy.clone(),
        )
        .with_previous_delay(delivery.last_delay);

        let mut next = delivery.clone();
        next.attempt = attempt;

        match context.decide_retry() {
            RetryDecision::Retry { delay, next_attempt_at } => {
                next.next_attempt_at = next_attempt_at;
                next.last_delay = delay;
                self.queue
                    .enqueue(&next, delay)
                    .await
                    .map_err(|e| DeliveryError::queue(e.to_string()))?;

                info!(
                    delivery_id = %delivery.id,
                    event_id = %delivery.event_id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    %next_attempt_at,
                    "delivery retry scheduled"
                );

                Ok(RetryOutcome::Requeued { attempt, delay, next_attempt_at })
            },
            RetryDecision::GiveUp { reason } => {
                self.dead_letter(next, reason.clone(), error.status_code()).await?;
                Ok(RetryOutcome::DeadLettered { reason })
            },
        }
    }

    /// Re-enqueues `delivery` after `delay` without consuming an attempt.
    ///
    /// Used when the target is saturated or its circuit is open. The retry
    /// window still applies.
    ///
    /// # Errors
    ///
    /// Returns error if the enqueue or the dead-letter write fails.
    pub async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<RetryOutcome> {
        let next_attempt_at = delay_from(self.clock.now_utc(), delay);

        if !within_window(delivery.first_attempt_at, next_attempt_at, self.policy.window) {
            self.dead_letter(delivery.clone(), WINDOW_EXHAUSTED.to_string(), None).await?;
            return Ok(RetryOutcome::DeadLettered { reason: WINDOW_EXHAUSTED.to_string() });
        }

        let mut next = delivery.clone();
        next.next_attempt_at = next_attempt_at;
        self.queue.enqueue(&next, delay).await.map_err(|e| DeliveryError::queue(e.to_string()))?;

        Ok(RetryOutcome::Requeued { attempt: next.attempt, delay, next_attempt_at })
    }

    /// Records `delivery` in the dead-letter sink.
    ///
    /// # Errors
    ///
    /// Returns error if the sink write fails.
    pub async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: String,
        last_status: Option<u16>,
    ) -> Result<()> {
        warn!(
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            target_id = %delivery.target_id,
            attempts = delivery.attempt,
            reason = %reason,
            "delivery dead-lettered"
        );

        let dead_lettered_at = self.clock.now_utc();
        self.dead_letters
            .record(DeadLetter { delivery, reason, last_status, dead_lettered_at })
            .await
    }
}
