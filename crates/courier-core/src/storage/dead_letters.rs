//! Repository for dead-lettered deliveries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeadLetter, Delivery, DeliveryId},
};

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    delivery: String,
    reason: String,
    last_status: Option<i32>,
    dead_lettered_at: DateTime<Utc>,
}

/// Repository for the `dead_letters` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a dead letter. Recording the same delivery twice keeps one
    /// row carrying the latest reason.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the insert fails.
    pub async fn insert(&self, dead_letter: &DeadLetter) -> Result<()> {
        let delivery = serde_json::to_string(&dead_letter.delivery)?;

        sqlx::query(
            r"
            INSERT INTO dead_letters (
                delivery_id, event_id, target_id, attempts, reason, last_status,
                delivery, dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (delivery_id) DO UPDATE
            SET attempts = EXCLUDED.attempts,
                reason = EXCLUDED.reason,
                last_status = EXCLUDED.last_status,
                delivery = EXCLUDED.delivery,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            ",
        )
        .bind(dead_letter.delivery.id)
        .bind(dead_letter.delivery.event_id.as_str())
        .bind(dead_letter.delivery.target_id)
        .bind(i32::try_from(dead_letter.delivery.attempt).unwrap_or(i32::MAX))
        .bind(&dead_letter.reason)
        .bind(dead_letter.last_status.map(i32::from))
        .bind(delivery)
        .bind(dead_letter.dead_lettered_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds the dead letter for a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored delivery is corrupt.
    pub async fn find(&self, delivery_id: DeliveryId) -> Result<Option<DeadLetter>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r"
            SELECT delivery, reason, last_status, dead_lettered_at
            FROM dead_letters
            WHERE delivery_id = $1
            ",
        )
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|row| -> Result<DeadLetter> {
            let delivery: Delivery = serde_json::from_str(&row.delivery)?;
            Ok(DeadLetter {
                delivery,
                reason: row.reason,
                last_status: row.last_status.and_then(|status| u16::try_from(status).ok()),
                dead_lettered_at: row.dead_lettered_at,
            })
        })
        .transpose()
    }

    /// Returns the number of dead letters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
