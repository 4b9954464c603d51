//! Deterministic test environment over the in-memory adapters.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::{
    Clock, Delivery, MulticastEventHandler, Target, TestClock, TracingEventHandler, WebhookEvent,
};
use courier_delivery::{
    cache::memory::InMemoryRegistrationSource,
    circuit::CircuitConfig,
    dead_letter::memory::InMemoryDeadLetterSink,
    engine::EngineAdapters,
    payload::memory::InMemoryPayloadStore,
    queue::memory::InMemoryDispatchQueue,
    DeliveryConfig, DeliveryEngine, EngineStats, FanoutEngine, RetryPolicy, SubscriptionCache,
};

use crate::events::RecordingEventHandler;

/// Upper bound on batches [`TestEnv::run_until_idle`] processes.
const MAX_IDLE_STEPS: usize = 10_000;

/// A delivery engine wired to in-memory adapters and a [`TestClock`].
///
/// Time only moves when a test advances it, so retry schedules spanning
/// hours run in milliseconds. Targets are real HTTP servers (see
/// [`MockEndpoint`](crate::MockEndpoint)).
pub struct TestEnv {
    /// Deterministic clock shared by every component.
    pub clock: TestClock,
    /// Registration store read by the subscription cache.
    pub registrations: InMemoryRegistrationSource,
    /// Dispatch queue.
    pub queue: InMemoryDispatchQueue,
    /// Payload store for offloaded payloads.
    pub payloads: InMemoryPayloadStore,
    /// Dead-letter sink.
    pub dead_letters: InMemoryDeadLetterSink,
    /// Recorded delivery lifecycle events.
    pub events: RecordingEventHandler,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with the default delivery configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Fan-out engine, for wiring an HTTP router.
    pub fn fanout(&self) -> Arc<FanoutEngine> {
        self.engine.fanout()
    }

    /// Subscription cache.
    pub fn cache(&self) -> Arc<SubscriptionCache> {
        self.engine.cache()
    }

    /// The clock as the trait object components take.
    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Registers a target subscribed to `event_types` through a new filter.
    ///
    /// The cache does not see it until [`refresh`](Self::refresh).
    pub async fn subscribe(&self, url: impl Into<String>, event_types: &[&str]) -> Target {
        let target = self.registrations.add_target(url).await;
        let filter = self.registrations.add_filter(event_types.iter().copied()).await;
        self.registrations.subscribe(target.id, filter.id).await;
        target
    }

    /// Reloads the subscription snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the registration store fails.
    pub async fn refresh(&self) -> Result<()> {
        self.engine.cache().refresh().await.context("subscription refresh failed")?;
        Ok(())
    }

    /// Fans `event` out and returns the enqueued deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if fan-out fails.
    pub async fn ingest(&self, event: &WebhookEvent) -> Result<Vec<Delivery>> {
        self.engine.fanout().handle(event).await.context("fan-out failed")
    }

    /// Processes one batch of visible deliveries at the current time.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be read.
    pub async fn process_batch(&self) -> Result<usize> {
        let processed = self.engine.process_batch().await.context("failed to process batch")?;
        tracing::debug!(processed, "batch processing completed");
        Ok(processed)
    }

    /// Processes deliveries until the queue is empty, advancing the clock to
    /// each retry as it comes due. Returns the number of deliveries
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns error if a batch fails or the queue never drains.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;

        for _ in 0..MAX_IDLE_STEPS {
            let batch = self.process_batch().await?;
            processed += batch;
            if batch > 0 {
                continue;
            }

            match self.queue.next_visible_at().await {
                Some(at) if at > self.clock.now_utc() => self.clock.advance_to(at),
                Some(_) => {},
                None => return Ok(processed),
            }
        }

        anyhow::bail!("queue did not drain within {MAX_IDLE_STEPS} batches")
    }

    /// Engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.engine.stats().await
    }
}

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    config: DeliveryConfig,
}

impl TestEnvBuilder {
    /// Default delivery configuration without retry jitter.
    pub fn new() -> Self {
        let config = DeliveryConfig {
            retry_policy: RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            ..DeliveryConfig::default()
        };
        Self { config }
    }

    /// Largest payload carried inline.
    #[must_use]
    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.config.fanout_config.inline_threshold = bytes;
        self
    }

    /// Retry policy; the fan-out deadline follows its window.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Circuit breaker thresholds.
    #[must_use]
    pub fn circuit_config(mut self, config: CircuitConfig) -> Self {
        self.config.circuit_config = config;
        self
    }

    /// Maximum in-flight calls per target.
    #[must_use]
    pub fn per_target_concurrency(mut self, limit: usize) -> Self {
        self.config.per_target_concurrency = limit;
        self
    }

    /// Arbitrary changes to the delivery configuration.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(&mut DeliveryConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Builds the environment.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub fn build(mut self) -> Result<TestEnv> {
        self.config.fanout_config.window = self.config.retry_policy.window;

        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let registrations = InMemoryRegistrationSource::new();
        let queue = InMemoryDispatchQueue::new(shared.clone())
            .with_max_message_bytes(self.config.max_message_bytes);
        let payloads = InMemoryPayloadStore::new().with_clock(shared.clone());
        let dead_letters = InMemoryDeadLetterSink::new();
        let events = RecordingEventHandler::new();

        let adapters = EngineAdapters {
            registrations: Arc::new(registrations.clone()),
            queue: Arc::new(queue.clone()),
            payloads: Arc::new(payloads.clone()),
            dead_letters: Arc::new(dead_letters.clone()),
        };
        let observers = MulticastEventHandler::new()
            .with(Arc::new(events.clone()))
            .with(Arc::new(TracingEventHandler));
        let engine = DeliveryEngine::new(adapters, self.config, shared, Arc::new(observers))
            .context("failed to build delivery engine")?;

        Ok(TestEnv { clock, registrations, queue, payloads, dead_letters, events, engine })
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}
