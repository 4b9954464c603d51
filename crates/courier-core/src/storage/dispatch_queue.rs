//! Repository backing the lease-based dispatch queue.
//!
//! A message is visible when `visible_at <= now`. Receiving a message stamps
//! it with a lease token and pushes `visible_at` forward by the visibility
//! timeout, so an unacknowledged message reappears on its own. Acks and
//! nacks must present the lease token they were issued; a stale token
//! touches nothing.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{error::Result, models::DeliveryId};

/// A message handed out by [`Repository::receive`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedMessage {
    /// Queue-assigned message identifier.
    pub id: Uuid,
    /// Encoded delivery.
    pub body: Vec<u8>,
    /// Number of times this message has been received, including this one.
    pub receive_count: i32,
}

/// Repository for dispatch queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a message that becomes visible at `visible_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        delivery_id: DeliveryId,
        body: &[u8],
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r"
            INSERT INTO dispatch_queue (id, delivery_id, body, visible_at, receive_count, enqueued_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            ",
        )
        .bind(id)
        .bind(delivery_id)
        .bind(body)
        .bind(visible_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Leases up to `batch_size` visible messages.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent receivers never block on
    /// or double-lease the same rows. Every message in the batch shares
    /// `lease_token`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn receive(
        &self,
        batch_size: usize,
        visibility_timeout: Duration,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>> {
        let invisible_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM dispatch_queue
            WHERE visible_at <= $1
            ORDER BY visible_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let messages = sqlx::query_as::<_, QueuedMessage>(
            r"
            UPDATE dispatch_queue
            SET lease_token = $2,
                visible_at = $3,
                receive_count = receive_count + 1
            WHERE id = ANY($1)
            RETURNING id, body, receive_count
            ",
        )
        .bind(&ids)
        .bind(lease_token)
        .bind(invisible_until)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(messages)
    }

    /// Deletes a leased message. Returns false when the lease is stale.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn ack(&self, id: Uuid, lease_token: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dispatch_queue WHERE id = $1 AND lease_token = $2")
            .bind(id)
            .bind(lease_token)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Releases a leased message so it becomes visible at `visible_at`.
    /// Returns false when the lease is stale.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn nack(
        &self,
        id: Uuid,
        lease_token: Uuid,
        visible_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dispatch_queue
            SET lease_token = NULL, visible_at = $3
            WHERE id = $1 AND lease_token = $2
            ",
        )
        .bind(id)
        .bind(lease_token)
        .bind(visible_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns the number of messages in the queue, leased or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn depth(&self) -> Result<i64> {
        let depth = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dispatch_queue")
            .fetch_one(&*self.pool)
            .await?;

        Ok(depth)
    }
}
