//! Read-only repository over the registration tables.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::debug;

use crate::{
    error::Result,
    models::{Filter, RegistrationSnapshot, Subscription, Target},
};

/// Reads targets, filters and subscriptions written by the registration API.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Loads every registration record in a single repeatable-read
    /// transaction so the three tables are mutually consistent.
    ///
    /// # Errors
    ///
    /// Returns error if any query fails.
    pub async fn load_snapshot(&self) -> Result<RegistrationSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let targets = sqlx::query_as::<_, Target>(
            "SELECT id, url, created_at, updated_at FROM targets ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        let filters = sqlx::query_as::<_, Filter>(
            "SELECT id, events, created_at, updated_at FROM filters ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r"
            SELECT id, target_id, filter_id, active, created_at, updated_at
            FROM subscriptions
            ORDER BY id
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            targets = targets.len(),
            filters = filters.len(),
            subscriptions = subscriptions.len(),
            "loaded registration snapshot"
        );

        Ok(RegistrationSnapshot { targets, filters, subscriptions })
    }
}
