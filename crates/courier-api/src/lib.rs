//! Courier HTTP API.
//!
//! Event ingestion, health checks, and the service configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server, AppState, HttpConfig};
