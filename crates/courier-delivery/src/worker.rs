//! Dispatcher worker loop.
//!
//! Each worker leases a batch from the dispatch queue, dispatches every
//! delivery in it concurrently through the shared [`Dispatcher`], and polls
//! again once the whole batch has settled. A slow target therefore holds at
//! most its bulkhead permits, never the rest of the batch. Workers stop
//! between batches when cancelled, so an in-flight attempt always settles.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
};

/// Back-off after a failed receive.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Per-worker polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Maximum deliveries leased per receive.
    pub batch_size: usize,
    /// Wait after an empty receive.
    pub poll_interval: Duration,
    /// Lease duration requested on receive.
    pub visibility_timeout: Duration,
}

/// Individual worker that processes leased deliveries.
pub struct DeliveryWorker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub fn new(
        id: usize,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, dispatcher, config, cancellation_token, clock }
    }

    /// Main worker loop - leases and processes deliveries until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails. Batch processing errors are
    /// logged and retried.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "worker batch processing failed");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        Ok(())
    }

    /// Leases one batch and processes its deliveries concurrently. Returns
    /// the batch size.
    ///
    /// A batch leased after cancellation is released back to the queue
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the receive fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let batch = self
            .dispatcher
            .queue()
            .receive(self.config.batch_size, self.config.visibility_timeout)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to receive deliveries: {e}")))?;
        let batch_size = batch.len();

        if batch_size == 0 {
            return Ok(0);
        }

        if self.cancellation_token.is_cancelled() {
            for leased in batch {
                if let Err(e) = self.dispatcher.queue().nack(leased.lease).await {
                    warn!(worker_id = self.id, error = %e, "failed to release lease on shutdown");
                }
            }
            return Ok(batch_size);
        }

        debug!(worker_id = self.id, batch_size, "processing delivery batch");

        let mut in_flight = JoinSet::new();
        for leased in batch {
            let dispatcher = self.dispatcher.clone();
            let delivery_id = leased.delivery.id;
            in_flight.spawn(async move { (delivery_id, dispatcher.process(leased).await) });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {},
                Ok((delivery_id, Err(error))) => error!(
                    worker_id = self.id,
                    delivery_id = %delivery_id,
                    error = %error,
                    "delivery processing failed"
                ),
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "delivery task panicked");
                },
            }
        }

        Ok(batch_size)
    }
}
