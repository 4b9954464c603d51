//! HTTP request handlers for the Courier API.
//!
//! - `health` - health, readiness and liveness checks
//! - `ingest` - event ingestion and fan-out
//!
//! Error responses share one shape: `{ "error": { "code", "message" } }`.

pub mod health;
pub mod ingest;

pub use health::{health_check, liveness_check, readiness_check};
pub use ingest::ingest_event;
