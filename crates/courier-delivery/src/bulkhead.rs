//! Per-target concurrency limits.
//!
//! Every target gets its own semaphore with `per_target_concurrency`
//! permits. A dispatcher that cannot get a permit defers the delivery
//! instead of waiting, so a slow target never holds more than its share of
//! the worker pool.

use std::sync::Arc;

use courier_core::TargetId;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{DeliveryError, Result};

/// Default number of concurrent calls allowed per target. Kept below
/// [`DEFAULT_WORKER_COUNT`](crate::DEFAULT_WORKER_COUNT).
pub const DEFAULT_PER_TARGET_CONCURRENCY: usize = 2;

/// Permit for one in-flight call. Released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Semaphores keyed by target.
#[derive(Debug)]
pub struct TargetBulkhead {
    max_concurrent: usize,
    semaphores: DashMap<TargetId, Arc<Semaphore>>,
}

impl TargetBulkhead {
    /// Creates a bulkhead allowing `max_concurrent` calls per target.
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent: max_concurrent.max(1), semaphores: DashMap::new() }
    }

    /// Takes a permit for `target_id` without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::TargetSaturated` when all permits for the
    /// target are in use.
    pub fn try_acquire(&self, target_id: TargetId) -> Result<BulkheadPermit> {
        let semaphore = self
            .semaphores
            .entry(target_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
            .clone();

        semaphore
            .try_acquire_owned()
            .map(|permit| BulkheadPermit { _permit: permit })
            .map_err(|_| DeliveryError::target_saturated(target_id))
    }

    /// Calls currently in flight to `target_id`.
    pub fn in_flight(&self, target_id: TargetId) -> usize {
        self.semaphores
            .get(&target_id)
            .map_or(0, |semaphore| self.max_concurrent - semaphore.available_permits())
    }

    /// Configured per-target limit.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl Default for TargetBulkhead {
    fn default() -> Self {
        Self::new(DEFAULT_PER_TARGET_CONCURRENCY)
    }
}
