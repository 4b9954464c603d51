//! Test infrastructure for deterministic delivery testing.
//!
//! Provides an engine wired to in-memory adapters and a virtual clock, mock
//! webhook targets, event fixtures, and a recorder for delivery lifecycle
//! events.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod fixtures;
pub mod http;

mod env;

pub use courier_core::{Clock, TestClock};
pub use env::{TestEnv, TestEnvBuilder};
pub use events::RecordingEventHandler;
pub use fixtures::{payload_of_size, EventBuilder};
pub use http::{MockEndpoint, MockResponse};
