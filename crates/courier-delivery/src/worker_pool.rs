//! Supervised set of dispatcher workers.
//!
//! Workers share one [`Dispatcher`] and one cancellation token. Shutdown
//! cancels the token and drains the set within a grace period; a worker
//! stops between batches, never in the middle of one.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::EngineStats,
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, WorkerConfig},
};

pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    worker_count: usize,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    workers: JoinSet<(usize, Result<()>)>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
        worker_count: usize,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            worker_count,
            stats,
            cancellation_token,
            workers: JoinSet::new(),
            clock,
        }
    }

    /// Spawns `worker_count` workers and returns once they are running.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when the pool has no workers.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker pool needs at least one worker"));
        }

        for worker_id in 0..self.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.dispatcher.clone(),
                self.config,
                self.cancellation_token.clone(),
                self.clock.clone(),
            );
            self.workers.spawn(async move { (worker_id, worker.run().await) });
        }

        self.stats.write().await.active_workers = self.worker_count;
        info!(worker_count = self.worker_count, "delivery workers spawned");
        Ok(())
    }

    /// Cancels every worker and waits up to `grace` for them to finish their
    /// current delivery.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running after `grace`
    /// (they are then aborted) and `WorkerPanic` if a worker panicked.
    pub async fn shutdown_graceful(mut self, grace: Duration) -> Result<()> {
        info!(running = self.running(), grace_ms = grace.as_millis(), "stopping delivery workers");
        self.cancellation_token.cancel();

        let mut panic = None;
        let drain = async {
            while let Some(joined) = self.workers.join_next().await {
                match joined {
                    Ok((worker_id, Ok(()))) => info!(worker_id, "delivery worker stopped"),
                    Ok((worker_id, Err(e))) => {
                        warn!(worker_id, error = %e, "delivery worker stopped with error");
                    },
                    Err(e) => {
                        error!(error = %e, "delivery worker panicked");
                        panic.get_or_insert(DeliveryError::WorkerPanic { error: e.to_string() });
                    },
                }
            }
        };
        let drained = tokio::time::timeout(grace, drain).await.is_ok();

        self.stats.write().await.active_workers = 0;

        if !drained {
            error!(grace_ms = grace.as_millis(), "delivery workers did not stop in time");
            self.workers.abort_all();
            return Err(DeliveryError::ShutdownTimeout { timeout: grace });
        }
        panic.map_or(Ok(()), Err)
    }

    /// Number of workers not yet reaped.
    pub fn running(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() && !self.cancellation_token.is_cancelled() {
            warn!(running = self.running(), "worker pool dropped without shutdown");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;
    use crate::{
        bulkhead::TargetBulkhead,
        circuit::{CircuitBreakerManager, CircuitConfig},
        client::DeliveryClient,
        dead_letter::memory::InMemoryDeadLetterSink,
        payload::memory::InMemoryPayloadStore,
        queue::memory::InMemoryDispatchQueue,
        retry::{RetryManager, RetryPolicy},
    };

    fn pool(worker_count: usize, stats: Arc<RwLock<EngineStats>>) -> WorkerPool {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let queue = Arc::new(InMemoryDispatchQueue::new(clock.clone()));
        let retry = Arc::new(RetryManager::new(
            queue.clone(),
            Arc::new(InMemoryDeadLetterSink::new()),
            RetryPolicy::default(),
            clock.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            Arc::new(InMemoryPayloadStore::new()),
            queue,
            retry,
            Arc::new(CircuitBreakerManager::new(CircuitConfig::default(), clock.clone())),
            Arc::new(TargetBulkhead::default()),
            clock.clone(),
        ));
        let config = WorkerConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(50),
            visibility_timeout: Duration::from_secs(60),
        };

        WorkerPool::new(dispatcher, config, worker_count, stats, CancellationToken::new(), clock)
    }

    #[tokio::test]
    async fn spawns_and_reaps_every_worker() {
        let stats: Arc<RwLock<EngineStats>> = Arc::default();
        let mut pool = pool(4, stats.clone());

        pool.spawn_workers().await.unwrap();
        assert_eq!(pool.running(), 4);
        assert_eq!(stats.read().await.active_workers, 4);

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn shutdown_before_spawn_succeeds() {
        let result = pool(2, Arc::default()).shutdown_graceful(Duration::from_millis(1)).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_pool_is_rejected() {
        let mut pool = pool(0, Arc::default());

        assert!(matches!(
            pool.spawn_workers().await,
            Err(DeliveryError::ConfigurationError { .. })
        ));
    }
}
