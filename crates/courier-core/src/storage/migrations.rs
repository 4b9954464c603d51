//! Idempotent schema setup.
//!
//! Every statement uses `IF NOT EXISTS`, so running the migrations on each
//! start is safe. The registration tables are created here only so a fresh
//! database is usable; the registration API owns their contents.

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "targets",
        r"
        CREATE TABLE IF NOT EXISTS targets (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "filters",
        r"
        CREATE TABLE IF NOT EXISTS filters (
            id UUID PRIMARY KEY,
            events TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "subscriptions",
        r"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id UUID PRIMARY KEY,
            target_id UUID NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
            filter_id UUID NOT NULL REFERENCES filters(id) ON DELETE CASCADE,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "dispatch_queue",
        r"
        CREATE TABLE IF NOT EXISTS dispatch_queue (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL,
            body BYTEA NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            lease_token UUID,
            receive_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "dispatch_queue visibility index",
        r"
        CREATE INDEX IF NOT EXISTS idx_dispatch_queue_visible_at
        ON dispatch_queue(visible_at)
        ",
    ),
    (
        "dispatch_queue delivery index",
        r"
        CREATE INDEX IF NOT EXISTS idx_dispatch_queue_delivery
        ON dispatch_queue(delivery_id)
        ",
    ),
    (
        "payloads",
        r"
        CREATE TABLE IF NOT EXISTS payloads (
            key TEXT PRIMARY KEY,
            content BYTEA NOT NULL,
            size_bytes BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "payloads retention index",
        r"
        CREATE INDEX IF NOT EXISTS idx_payloads_created_at
        ON payloads(created_at)
        ",
    ),
    (
        "dead_letters",
        r"
        CREATE TABLE IF NOT EXISTS dead_letters (
            delivery_id UUID PRIMARY KEY,
            event_id TEXT NOT NULL,
            target_id UUID NOT NULL,
            attempts INTEGER NOT NULL,
            reason TEXT NOT NULL,
            last_status INTEGER,
            delivery TEXT NOT NULL,
            dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
];

/// Creates all tables and indexes used by Courier.
///
/// # Errors
///
/// Returns error on the first statement that fails.
pub async fn run(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            crate::error::CoreError::Database(format!("migration '{name}' failed: {e}"))
        })?;
    }

    info!(statements = STATEMENTS.len(), "database schema up to date");
    Ok(())
}
