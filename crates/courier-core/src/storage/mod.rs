//! Database access layer for the delivery engine.
//!
//! Each table is owned by one repository. The registration tables are only
//! read here; the registration API owns their writes. The queue, payload and
//! dead-letter tables are owned by the delivery engine.
//!
//! All database operations go through these repositories.

use std::sync::Arc;

use sqlx::PgPool;

pub mod dead_letters;
pub mod dispatch_queue;
pub mod migrations;
pub mod payloads;
pub mod registrations;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Read-only access to targets, filters and subscriptions.
    pub registrations: Arc<registrations::Repository>,

    /// Lease-based dispatch queue.
    pub dispatch_queue: Arc<dispatch_queue::Repository>,

    /// Content-addressed payload blobs.
    pub payloads: Arc<payloads::Repository>,

    /// Terminal store for abandoned deliveries.
    pub dead_letters: Arc<dead_letters::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            registrations: Arc::new(registrations::Repository::new(pool.clone())),
            dispatch_queue: Arc::new(dispatch_queue::Repository::new(pool.clone())),
            payloads: Arc::new(payloads::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_with_lazy_pool() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/courier").unwrap();
        let storage = Storage::new(pool);

        assert!(Arc::ptr_eq(&storage.pool(), &storage.pool));
    }
}
