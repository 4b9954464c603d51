//! Property-based tests for fan-out and retry invariants.
//!
//! Fan-out properties run against the in-memory engine; the retry properties
//! exercise the policy directly.

use std::{collections::HashSet, time::Duration};

use courier_core::{DeliveryId, EventId, TargetId};
use courier_delivery::{retry::BackoffStrategy, RetryPolicy};
use courier_testing::{EventBuilder, TestEnv};
use proptest::{
    prelude::*,
    test_runner::{Config as ProptestConfig, TestRunner},
};

/// Creates property test configuration based on environment.
///
/// Uses environment variables:
/// - `PROPTEST_CASES`: Number of test cases (default: 16, 64 on CI)
/// - `CI`: If set to "true", uses CI configuration
fn proptest_config() -> ProptestConfig {
    let is_ci = std::env::var("CI").unwrap_or_default() == "true";
    let default_cases = if is_ci { 64 } else { 16 };

    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig::with_cases(cases)
}

fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
    ]
}

proptest! {
    #![proptest_config(proptest_config())]

    /// The same (event, target) pair always yields the same delivery id, and
    /// different targets never collide.
    #[test]
    fn delivery_ids_are_deterministic(event_id in "[a-zA-Z0-9_-]{1,64}", targets in 1usize..16) {
        let event_id = EventId::from(event_id);
        let targets: Vec<TargetId> = (0..targets).map(|_| TargetId::new()).collect();

        let first: Vec<_> = targets.iter().map(|t| DeliveryId::derive(&event_id, *t)).collect();
        let second: Vec<_> = targets.iter().map(|t| DeliveryId::derive(&event_id, *t)).collect();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.iter().collect::<HashSet<_>>().len(), targets.len());
    }

    /// Retry delays never shrink as attempts grow, whatever the jitter draws.
    #[test]
    fn retry_delays_never_decrease(
        base_secs in 1u64..120,
        cap_factor in 1u64..200,
        jitter_factor in 0.0f64..=1.0,
        backoff_strategy in backoff_strategy(),
    ) {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(base_secs * cap_factor),
            jitter_factor,
            backoff_strategy,
            ..RetryPolicy::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=30 {
            let delay = policy.delay_for_attempt(attempt, None);
            prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    /// A target-supplied delay is honoured up to the cap.
    #[test]
    fn retry_after_is_respected_up_to_the_cap(attempt in 1u32..20, retry_after in 0u64..10_000) {
        let policy = RetryPolicy::default();
        let requested = Duration::from_secs(retry_after);

        let delay = policy.delay_for_attempt(attempt, Some(requested));

        prop_assert!(delay >= requested.min(policy.max_delay));
        prop_assert!(delay <= policy.max_delay);
    }
}

/// Every distinct subscribed target receives exactly one delivery, however
/// many subscriptions bind it and however many unrelated targets exist.
#[test]
fn fanout_delivers_once_per_subscribed_target() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut runner = TestRunner::new(proptest_config());

    let bindings = prop::collection::vec((any::<bool>(), 1usize..4), 0..12);

    runner
        .run(&bindings, |bindings| {
            rt.block_on(async {
                let env = TestEnv::new().unwrap();
                let mut expected = HashSet::new();

                for (n, (subscribed, times)) in bindings.iter().enumerate() {
                    let event_type = if *subscribed { "order.created" } else { "order.deleted" };
                    let target =
                        env.registrations.add_target(format!("https://t{n}.example/hook")).await;
                    for _ in 0..*times {
                        let filter = env.registrations.add_filter([event_type]).await;
                        env.registrations.subscribe(target.id, filter.id).await;
                    }
                    if *subscribed {
                        expected.insert(target.id);
                    }
                }
                env.refresh().await.unwrap();

                let deliveries = env.ingest(&EventBuilder::new().build()).await.unwrap();
                let delivered: HashSet<_> = deliveries.iter().map(|d| d.target_id).collect();

                prop_assert_eq!(deliveries.len(), expected.len());
                prop_assert_eq!(delivered, expected);
                prop_assert_eq!(env.queue.len().await, deliveries.len());
                Ok(())
            })
        })
        .unwrap();
}

/// Payloads at or below the threshold travel inline; larger ones are stored
/// exactly once regardless of the number of targets.
#[test]
fn payload_placement_follows_the_threshold() {
    const THRESHOLD: usize = 1024;

    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut runner = TestRunner::new(proptest_config());

    runner
        .run(&(0usize..THRESHOLD * 3, 1usize..5), |(size, targets)| {
            rt.block_on(async {
                let env = TestEnv::builder().inline_threshold(THRESHOLD).build().unwrap();
                for n in 0..targets {
                    env.subscribe(format!("https://t{n}.example/hook"), &["order.created"]).await;
                }
                env.refresh().await.unwrap();

                let event = EventBuilder::new().payload_size(size).build();
                let deliveries = env.ingest(&event).await.unwrap();

                prop_assert_eq!(deliveries.len(), targets);
                for delivery in &deliveries {
                    prop_assert_eq!(delivery.payload.is_inline(), size <= THRESHOLD);
                    prop_assert_eq!(delivery.payload.size(), size);
                }
                let expected_puts = usize::from(size > THRESHOLD);
                prop_assert_eq!(env.payloads.put_count().await, expected_puts);
                Ok(())
            })
        })
        .unwrap();
}
