//! Property-based tests for backoff scheduling and fan-out.
//!
//! Runs against the in-memory adapters and a `TestClock`, so a full 24h
//! retry schedule is explored without waiting.

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{
    Clock, Delivery, DeliveryId, DeliveryPayload, EventId, SubscriptionId, TargetId, TestClock,
    WebhookEvent,
};
use courier_delivery::{
    cache::{memory::InMemoryRegistrationSource, CacheConfig},
    dead_letter::memory::InMemoryDeadLetterSink,
    payload::{memory::InMemoryPayloadStore, PayloadStore},
    queue::{memory::InMemoryDispatchQueue, DispatchQueue},
    retry::{BackoffStrategy, WINDOW_EXHAUSTED},
    DeliveryError, FanoutConfig, FanoutEngine, RetryManager, RetryOutcome, RetryPolicy,
    SubscriptionCache,
};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn strategy_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
    ]
}

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..=120, 60u64..=7200, 0.0f64..=1.0, strategy_strategy(), 1u64..=48).prop_map(
        |(base, max, jitter_factor, backoff_strategy, window_hours)| RetryPolicy {
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max.max(base)),
            jitter_factor,
            backoff_strategy,
            window: Duration::from_secs(window_hours * 3600),
            max_attempts: None,
        },
    )
}

/// Policies whose full schedule stays within a few hundred attempts.
fn bounded_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (60u64..=600, 600u64..=7200, 0.0f64..=1.0, strategy_strategy(), 1u64..=12).prop_map(
        |(base, max, jitter_factor, backoff_strategy, window_hours)| RetryPolicy {
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            jitter_factor,
            backoff_strategy,
            window: Duration::from_secs(window_hours * 3600),
            max_attempts: None,
        },
    )
}

fn fresh_delivery(clock: &TestClock) -> Delivery {
    let event_id = EventId::generate();
    let target_id = TargetId::new();
    let now = clock.now_utc();
    Delivery {
        id: DeliveryId::derive(&event_id, target_id),
        event_id,
        event_type: "order.created".to_string(),
        target_id,
        subscription_id: SubscriptionId::new(),
        url: "https://example.com/hook".to_string(),
        payload: DeliveryPayload::Inline { data: Bytes::from_static(b"{}") },
        attempt: 0,
        last_delay: Duration::ZERO,
        first_attempt_at: now,
        next_attempt_at: now,
        deadline: now + chrono::Duration::hours(24),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn delays_never_decrease(policy in policy_strategy(), attempt in 1u32..40) {
        let current = policy.delay_for_attempt(attempt, None);
        let next = policy.delay_for_attempt(attempt + 1, None);

        prop_assert!(current <= next, "attempt {attempt}: {current:?} > {next:?}");
        prop_assert!(next <= policy.max_delay);
    }

    #[test]
    fn retry_after_is_a_lower_bound(policy in policy_strategy(), retry_after in 0u64..10_000) {
        let requested = Duration::from_secs(retry_after);
        let delay = policy.delay_for_attempt(1, Some(requested));

        prop_assert!(delay >= requested.min(policy.max_delay));
        prop_assert!(delay <= policy.max_delay);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn schedule_respects_window_and_counts_attempts(policy in bounded_policy_strategy()) {
        runtime().block_on(async {
            let clock = TestClock::new();
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let queue = InMemoryDispatchQueue::new(shared.clone());
            let dead_letters = InMemoryDeadLetterSink::new();
            let manager = RetryManager::new(
                Arc::new(queue.clone()),
                Arc::new(dead_letters.clone()),
                policy.clone(),
                shared,
            );

            let mut delivery = fresh_delivery(&clock);
            let first_attempt_at = delivery.first_attempt_at;
            let error = DeliveryError::server_error(503, "unavailable");
            let mut previous_delay = Duration::ZERO;

            loop {
                let outcome = manager.schedule(&delivery, &error).await.unwrap();
                match outcome {
                    RetryOutcome::Requeued { attempt, delay, next_attempt_at } => {
                        prop_assert_eq!(attempt, delivery.attempt + 1);
                        prop_assert!(delay >= previous_delay);
                        let elapsed = (next_attempt_at - first_attempt_at).to_std().unwrap();
                        prop_assert!(elapsed <= policy.window);

                        previous_delay = delay;
                        delivery.attempt = attempt;
                        delivery.last_delay = delay;
                        delivery.next_attempt_at = next_attempt_at;
                        clock.advance_to(next_attempt_at);
                    },
                    RetryOutcome::DeadLettered { reason } => {
                        prop_assert_eq!(reason, WINDOW_EXHAUSTED);
                        break;
                    },
                }
            }

            let dead_letter = dead_letters.find(delivery.id).await.unwrap();
            prop_assert_eq!(dead_letter.delivery.attempt, delivery.attempt + 1);
            prop_assert_eq!(dead_letter.last_status, Some(503));
            Ok(())
        })?;
    }

    #[test]
    fn fan_out_yields_one_delivery_per_target(
        target_count in 1usize..20,
        payload_len in 0usize..256,
        threshold in 0usize..256,
    ) {
        runtime().block_on(async {
            let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
            let registrations = InMemoryRegistrationSource::new();
            let cache = Arc::new(SubscriptionCache::new(
                Arc::new(registrations.clone()),
                clock.clone(),
                CacheConfig::default(),
            ));
            let payloads = InMemoryPayloadStore::new();
            let queue = InMemoryDispatchQueue::new(clock.clone());
            let engine = FanoutEngine::new(
                cache.clone(),
                Arc::new(payloads.clone()),
                Arc::new(queue.clone()),
                clock,
                FanoutConfig { inline_threshold: threshold, ..FanoutConfig::default() },
            );

            let filter = registrations.add_filter(["order.created"]).await;
            let mut targets = HashSet::new();
            for n in 0..target_count {
                let target = registrations.add_target(format!("https://t{n}.example/hook")).await;
                registrations.subscribe(target.id, filter.id).await;
                targets.insert(target.id);
            }
            cache.refresh().await.unwrap();

            let body = Bytes::from(vec![b'x'; payload_len]);
            let event = WebhookEvent::new(EventId::generate(), "order.created", body.clone());
            let deliveries = engine.handle(&event).await.unwrap();

            prop_assert_eq!(deliveries.len(), target_count);
            let delivered_to: HashSet<_> = deliveries.iter().map(|d| d.target_id).collect();
            prop_assert_eq!(&delivered_to, &targets);
            let ids: HashSet<_> = deliveries.iter().map(|d| d.id).collect();
            prop_assert_eq!(ids.len(), target_count);
            prop_assert_eq!(queue.len().await, target_count);

            for delivery in &deliveries {
                match &delivery.payload {
                    DeliveryPayload::Inline { data } => {
                        prop_assert!(payload_len <= threshold);
                        prop_assert_eq!(data, &body);
                    },
                    DeliveryPayload::Reference { key, size } => {
                        prop_assert!(payload_len > threshold);
                        prop_assert_eq!(*size, payload_len);
                        prop_assert_eq!(payloads.get(key).await.unwrap(), body.clone());
                    },
                }
            }
            prop_assert!(payloads.put_count().await <= 1);
            Ok(())
        })?;
    }

    #[test]
    fn mixed_rate_limits_and_server_errors_never_shorten_delays(
        policy in bounded_policy_strategy(),
        failures in prop::collection::vec(prop::option::of(0u64..7200), 1..30),
    ) {
        runtime().block_on(async {
            let clock = TestClock::new();
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let queue = InMemoryDispatchQueue::new(shared.clone());
            let manager = RetryManager::new(
                Arc::new(queue.clone()),
                Arc::new(InMemoryDeadLetterSink::new()),
                policy,
                shared,
            );

            let mut delivery = fresh_delivery(&clock);
            let mut previous_delay = Duration::ZERO;

            for retry_after in failures {
                let error = match retry_after {
                    Some(seconds) => DeliveryError::rate_limited(Some(seconds)),
                    None => DeliveryError::server_error(500, "boom"),
                };
                match manager.schedule(&delivery, &error).await.unwrap() {
                    RetryOutcome::Requeued { delay, next_attempt_at, .. } => {
                        prop_assert!(
                            delay >= previous_delay,
                            "{error}: {delay:?} < {previous_delay:?}"
                        );
                        previous_delay = delay;

                        clock.advance_to(next_attempt_at);
                        let mut leased = queue.receive(1, Duration::from_secs(60)).await.unwrap();
                        prop_assert_eq!(leased.len(), 1);
                        let leased = leased.remove(0);
                        queue.ack(leased.lease).await.unwrap();
                        delivery = leased.delivery;
                        prop_assert_eq!(delivery.last_delay, delay);
                    },
                    RetryOutcome::DeadLettered { .. } => break,
                }
            }
            Ok(())
        })?;
    }
}
