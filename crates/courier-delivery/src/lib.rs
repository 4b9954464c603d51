//! Webhook fan-out and delivery engine.
//!
//! This crate turns one incoming event into zero or more outbound HTTP
//! deliveries and carries each of them to a terminal state with
//! at-least-once semantics.
//!
//! # Architecture
//!
//! ```text
//! event ──▶ FanoutEngine ──▶ DispatchQueue ──▶ Dispatcher ──▶ target
//!              │  ▲               ▲   │            │
//!              │  │               │   │            ├─ 2xx ──▶ ack
//!              ▼  │               │   │            ├─ permanent ──▶ DeadLetterSink
//!       PayloadStore  SubscriptionCache            └─ retryable ──▶ RetryManager
//!                                 └────────── delayed enqueue ────────┘
//! ```
//!
//! 1. **Fan-out** - match the event type against the subscription cache and
//!    enqueue one delivery per target, offloading large payloads
//! 2. **Dispatch** - lease deliveries, check the circuit and bulkhead,
//!    resolve the payload and POST it
//! 3. **Retry** - re-enqueue with backoff through the queue's delayed
//!    visibility, or dead-letter once the retry window is exhausted
//!
//! Every adapter (queue, payload store, dead-letter sink, registration
//! source) is a trait with a PostgreSQL implementation and an in-memory one
//! under its `memory` module.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, Clock, RealClock, TracingEventHandler};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let storage = Arc::new(Storage::new(pool));
//! let mut engine = DeliveryEngine::postgres(
//!     storage,
//!     DeliveryConfig::default(),
//!     clock,
//!     Arc::new(TracingEventHandler),
//! )?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod cache;
pub mod circuit;
pub mod client;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod payload;
pub mod queue;
pub mod retry;
mod worker;
mod worker_pool;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use cache::{SubscriptionCache, TargetMatch};
pub use dispatcher::{Dispatcher, Outcome};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use fanout::{FanoutConfig, FanoutEngine};
pub use retry::{RetryManager, RetryOutcome, RetryPolicy};

/// Default number of concurrent dispatcher workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of deliveries leased per receive.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Largest queue message accepted by the dispatch queue.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Largest payload carried inline in a queue message.
///
/// Base64 grows the payload by a third, which leaves room for the rest of
/// the delivery envelope under [`DEFAULT_MAX_MESSAGE_BYTES`].
pub const DEFAULT_INLINE_THRESHOLD: usize = 128 * 1024;

/// `at + delay`, saturating at the largest representable timestamp.
pub(crate) fn delay_from(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
