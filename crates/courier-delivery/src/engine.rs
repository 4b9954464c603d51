//! Delivery engine wiring and lifecycle.
//!
//! The engine assembles the adapters into a fan-out engine and a
//! dispatcher, runs the subscription cache refresher and the dispatcher
//! worker pool, and shuts both down gracefully.

use std::{sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock, EventHandler};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bulkhead::{TargetBulkhead, DEFAULT_PER_TARGET_CONCURRENCY},
    cache::{CacheConfig, PostgresRegistrationSource, RegistrationSource, SubscriptionCache},
    circuit::{CircuitBreakerManager, CircuitConfig},
    client::{ClientConfig, DeliveryClient},
    dead_letter::{DeadLetterSink, PostgresDeadLetterSink},
    dispatcher::{Dispatcher, Outcome, DEFAULT_DEFER_DELAY},
    error::{DeliveryError, Result},
    fanout::{FanoutConfig, FanoutEngine},
    payload::{retention_cutoff, PayloadStore, PostgresPayloadStore},
    queue::{DispatchQueue, PostgresDispatchQueue},
    retry::{RetryManager, RetryOutcome, RetryPolicy},
    worker::{DeliveryWorker, WorkerConfig},
    worker_pool::WorkerPool,
    DEFAULT_MAX_MESSAGE_BYTES,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent dispatcher workers.
    pub worker_count: usize,

    /// Maximum deliveries leased per receive.
    pub batch_size: usize,

    /// How long a worker waits after an empty receive.
    pub poll_interval: Duration,

    /// Lease duration; an unacked delivery is redelivered after it.
    pub visibility_timeout: Duration,

    /// Maximum in-flight calls per target.
    pub per_target_concurrency: usize,

    /// Delay applied to deliveries deferred by the circuit breaker or the
    /// bulkhead.
    pub defer_delay: Duration,

    /// Largest encoded queue message.
    pub max_message_bytes: usize,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff and retry window.
    pub retry_policy: RetryPolicy,

    /// Per-target circuit breaker thresholds.
    pub circuit_config: CircuitConfig,

    /// Subscription cache refresh.
    pub cache_config: CacheConfig,

    /// Payload placement.
    pub fanout_config: FanoutConfig,

    /// Shutdown timeout - maximum time to wait for workers to complete.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let retry_policy = RetryPolicy::default();

        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(60),
            per_target_concurrency: DEFAULT_PER_TARGET_CONCURRENCY,
            defer_delay: DEFAULT_DEFER_DELAY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            client_config: ClientConfig::default(),
            fanout_config: FanoutConfig { window: retry_policy.window, ..FanoutConfig::default() },
            retry_policy,
            circuit_config: CircuitConfig::default(),
            cache_config: CacheConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of active dispatcher workers.
    pub active_workers: usize,
    /// Leased deliveries processed since startup.
    pub deliveries_processed: u64,
    /// Deliveries acknowledged by their target.
    pub successful_deliveries: u64,
    /// Failed attempts that were requeued.
    pub retries_scheduled: u64,
    /// Deliveries requeued without an attempt.
    pub deferred_deliveries: u64,
    /// Deliveries handed to the dead-letter sink.
    pub dead_lettered: u64,
    /// Deliveries currently being processed.
    pub in_flight_deliveries: u64,
}

impl EngineStats {
    pub(crate) fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success { .. } => self.successful_deliveries += 1,
            Outcome::PermanentFailure { .. }
            | Outcome::RetryableFailure { retry: RetryOutcome::DeadLettered { .. }, .. }
            | Outcome::Deferred { retry: RetryOutcome::DeadLettered { .. }, .. } => {
                self.dead_lettered += 1;
            },
            Outcome::RetryableFailure { .. } => self.retries_scheduled += 1,
            Outcome::Deferred { .. } => self.deferred_deliveries += 1,
        }
    }
}

/// The adapters the engine runs on.
#[derive(Clone)]
pub struct EngineAdapters {
    /// Registration store read by the subscription cache.
    pub registrations: Arc<dyn RegistrationSource>,
    /// Dispatch queue.
    pub queue: Arc<dyn DispatchQueue>,
    /// Payload store for offloaded payloads.
    pub payloads: Arc<dyn PayloadStore>,
    /// Dead-letter sink.
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl EngineAdapters {
    /// PostgreSQL-backed adapters sharing one storage handle.
    pub fn postgres(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            registrations: Arc::new(PostgresRegistrationSource::new(storage.clone())),
            queue: Arc::new(
                PostgresDispatchQueue::new(storage.clone(), clock.clone())
                    .with_max_message_bytes(max_message_bytes),
            ),
            payloads: Arc::new(PostgresPayloadStore::new(storage.clone(), clock)),
            dead_letters: Arc::new(PostgresDeadLetterSink::new(storage)),
        }
    }
}

/// Main delivery engine coordinating fan-out and dispatcher workers.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    cache: Arc<SubscriptionCache>,
    fanout: Arc<FanoutEngine>,
    dispatcher: Arc<Dispatcher>,
    circuits: Arc<CircuitBreakerManager>,
    payloads: Arc<dyn PayloadStore>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    refresher: Option<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine over the given adapters.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn new(
        adapters: EngineAdapters,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let cache = Arc::new(SubscriptionCache::new(
            adapters.registrations,
            clock.clone(),
            config.cache_config.clone(),
        ));
        let fanout = Arc::new(FanoutEngine::new(
            cache.clone(),
            adapters.payloads.clone(),
            adapters.queue.clone(),
            clock.clone(),
            config.fanout_config.clone(),
        ));
        let retry = Arc::new(RetryManager::new(
            adapters.queue.clone(),
            adapters.dead_letters,
            config.retry_policy.clone(),
            clock.clone(),
        ));
        let circuits =
            Arc::new(CircuitBreakerManager::new(config.circuit_config.clone(), clock.clone()));
        let bulkhead = Arc::new(TargetBulkhead::new(config.per_target_concurrency));
        let stats = Arc::new(RwLock::new(EngineStats::default()));

        let payloads = adapters.payloads;
        let dispatcher = Arc::new(
            Dispatcher::new(
                client,
                payloads.clone(),
                adapters.queue,
                retry,
                circuits.clone(),
                bulkhead,
                clock.clone(),
            )
            .with_event_handler(event_handler)
            .with_stats(stats.clone())
            .with_defer_delay(config.defer_delay),
        );

        Ok(Self {
            config,
            cache,
            fanout,
            dispatcher,
            circuits,
            payloads,
            stats,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            refresher: None,
            clock,
        })
    }

    /// Creates an engine over the PostgreSQL adapters.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn postgres(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let adapters = EngineAdapters::postgres(storage, clock.clone(), config.max_message_bytes);
        Self::new(adapters, config, clock, event_handler)
    }

    /// Loads the first subscription snapshot, then starts the cache
    /// refresher and the worker pool.
    ///
    /// A failed initial load is logged; the refresher keeps retrying and
    /// [`SubscriptionCache::is_loaded`] stays false until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting webhook delivery engine"
        );

        if let Err(error) = self.cache.refresh().await {
            warn!(error = %error, "initial subscription cache load failed");
        }

        let cache = self.cache.clone();
        let token = self.cancellation_token.clone();
        self.refresher = Some(tokio::spawn(cache.run_refresh_loop(token)));

        let mut worker_pool = WorkerPool::new(
            self.dispatcher.clone(),
            self.worker_config(),
            self.config.worker_count,
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Signals all workers to stop taking new deliveries and waits for the
    /// ones in flight to settle within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown times out or a worker panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        if let Some(refresher) = self.refresher.take() {
            if let Err(error) = refresher.await {
                warn!(error = %error, "subscription cache refresher failed to stop cleanly");
            }
        }

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Leases and processes one batch on the calling task. Returns the
    /// number of deliveries processed.
    ///
    /// Runs the same code path as a pool worker without starting one.
    ///
    /// # Errors
    ///
    /// Returns error if the receive fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(
            0,
            self.dispatcher.clone(),
            self.worker_config(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }

    /// Deletes offloaded payloads that no live delivery can still reference:
    /// those last stored more than the retry window plus the visibility
    /// timeout ago. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the payload store fails.
    pub async fn sweep_payloads(&self) -> Result<u64> {
        let cutoff = retention_cutoff(
            self.clock.now_utc(),
            self.config.retry_policy.window,
            self.config.visibility_timeout,
        );
        let deleted = self
            .payloads
            .delete_created_before(cutoff)
            .await
            .map_err(|e| DeliveryError::payload(e.to_string()))?;

        info!(deleted, %cutoff, "swept expired payloads");
        Ok(deleted)
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// The subscription cache.
    pub fn cache(&self) -> Arc<SubscriptionCache> {
        self.cache.clone()
    }

    /// The fan-out engine feeding this engine's queue.
    pub fn fanout(&self) -> Arc<FanoutEngine> {
        self.fanout.clone()
    }

    /// The dispatcher shared by the workers.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Per-target circuit breakers.
    pub fn circuits(&self) -> Arc<CircuitBreakerManager> {
        self.circuits.clone()
    }

    /// The engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.config.batch_size,
            poll_interval: self.config.poll_interval,
            visibility_timeout: self.config.visibility_timeout,
        }
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.refresher.is_some() {
            self.cancellation_token.cancel();
        }
    }
}
