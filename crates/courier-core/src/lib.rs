//! Core domain models, time abstraction and persistence for Courier.
//!
//! Provides strongly-typed identifiers, the event and delivery records that
//! flow through the delivery pipeline, delivery lifecycle events, and the
//! PostgreSQL repositories backing the production adapters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryDeadLetteredEvent, DeliveryEvent, DeliveryRetryScheduledEvent, DeliverySucceededEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler, TracingEventHandler,
};
pub use models::{
    DeadLetter, Delivery, DeliveryId, DeliveryPayload, EventId, Filter, FilterId, PayloadRef,
    RegistrationSnapshot, Subscription, SubscriptionId, Target, TargetId, WebhookEvent,
};
pub use time::{Clock, RealClock, TestClock};
