//! Repository for offloaded payload blobs.
//!
//! Rows are keyed by content hash. Content never changes under a key, but
//! `created_at` moves forward on every `put`, so a blob shared by events
//! days apart is retained from the latest of them. Garbage collection is an
//! external lifecycle job built on [`Repository::delete_created_before`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::PayloadRef};

/// Repository for payload blobs.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Stores `content` under `key`. Storing an existing key only refreshes
    /// its `created_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn put(&self, key: &PayloadRef, content: &[u8], now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO payloads (key, content, size_bytes, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET created_at = GREATEST(payloads.created_at, EXCLUDED.created_at)
            ",
        )
        .bind(key.as_str())
        .bind(content)
        .bind(i64::try_from(content.len()).unwrap_or(i64::MAX))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fetches the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn get(&self, key: &PayloadRef) -> Result<Option<Vec<u8>>> {
        let content =
            sqlx::query_scalar::<_, Vec<u8>>("SELECT content FROM payloads WHERE key = $1")
                .bind(key.as_str())
                .fetch_optional(&*self.pool)
                .await?;

        Ok(content)
    }

    /// Deletes blobs created before `cutoff`, returning the number removed.
    ///
    /// Callers must keep `cutoff` older than the retry window plus the
    /// queue visibility timeout, or in-flight deliveries lose their payload.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM payloads WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
