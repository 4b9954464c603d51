//! Core domain models and strongly-typed identifiers.
//!
//! Registration records (targets, filters, subscriptions) are read-only
//! views over the registration store. Events and deliveries are immutable
//! values that flow through fan-out, the dispatch queue and the dispatcher.

use std::{fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Namespace for deterministic delivery identifiers.
///
/// Changing this value changes every derived `DeliveryId`, which breaks
/// deduplication for deliveries already in flight.
pub const DELIVERY_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9a0d_4c57_8e21_f4d0_a9b3_c715);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a registered webhook destination.
    TargetId
}

uuid_id! {
    /// Identifier of a named event-type filter.
    FilterId
}

uuid_id! {
    /// Identifier of a target-to-filter binding.
    SubscriptionId
}

uuid_id! {
    /// Identifier of one (event, target) delivery.
    ///
    /// Derived deterministically with [`DeliveryId::derive`] so that
    /// redelivered events and duplicated queue messages share an identity.
    DeliveryId
}

impl DeliveryId {
    /// Derives the identity of the delivery of `event_id` to `target_id`.
    ///
    /// The same pair always yields the same identifier.
    pub fn derive(event_id: &EventId, target_id: TargetId) -> Self {
        let name = format!("{}\n{}", event_id.as_str(), target_id);
        Self(Uuid::new_v5(&DELIVERY_NAMESPACE, name.as_bytes()))
    }
}

/// Producer-supplied event identifier.
///
/// Opaque and stable across redeliveries of the same event, which is what
/// makes delivery identities deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Generates a fresh identifier for events that arrive without one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An application event awaiting fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Stable producer identifier used for deduplication.
    pub event_id: EventId,
    /// Event type used for subscription matching.
    pub event_type: String,
    /// Raw payload bytes, never interpreted.
    pub payload: Bytes,
}

impl WebhookEvent {
    /// Creates a new event.
    pub fn new(
        event_id: impl Into<EventId>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self { event_id: event_id.into(), event_type: event_type.into(), payload: payload.into() }
    }
}

/// A registered destination URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Target {
    /// Unique identifier.
    pub id: TargetId,
    /// Absolute HTTP(S) URL that receives webhook messages.
    pub url: String,
    /// When this target was registered.
    pub created_at: DateTime<Utc>,
    /// When this target was last changed.
    pub updated_at: DateTime<Utc>,
}

/// A named set of event types a subscriber cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Filter {
    /// Unique identifier.
    pub id: FilterId,
    /// Event types matched by this filter.
    pub events: Vec<String>,
    /// When this filter was created.
    pub created_at: DateTime<Utc>,
    /// When this filter was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Filter {
    /// Returns true when the filter selects `event_type`.
    pub fn matches(&self, event_type: &str) -> bool {
        self.events.iter().any(|candidate| candidate == event_type)
    }
}

/// Binding of a target to a filter.
///
/// Only active subscriptions participate in matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,
    /// Destination of matching events.
    pub target_id: TargetId,
    /// Filter selecting the event types.
    pub filter_id: FilterId,
    /// Whether the subscription is currently delivering.
    pub active: bool,
    /// When this subscription was created.
    pub created_at: DateTime<Utc>,
    /// When this subscription was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Full read of the registration store used to rebuild the subscription
/// index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    /// All registered targets.
    pub targets: Vec<Target>,
    /// All filters.
    pub filters: Vec<Filter>,
    /// All subscriptions, active or not.
    pub subscriptions: Vec<Subscription>,
}

/// Opaque key of a payload held in the payload store.
///
/// Keys are content addressed (`sha256:<hex>`), so storing the same bytes
/// twice yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    /// Computes the reference for `content`.
    pub fn for_content(content: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(content))))
    }

    /// Wraps an existing key without validation.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when `content` hashes to this reference.
    pub fn verifies(&self, content: &[u8]) -> bool {
        *self == Self::for_content(content)
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload attached to a delivery for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryPayload {
    /// Payload carried inside the queue message.
    Inline {
        /// Raw payload bytes, base64 encoded on the wire.
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// Payload offloaded to the payload store.
    Reference {
        /// Key in the payload store.
        key: PayloadRef,
        /// Payload size in bytes.
        size: usize,
    },
}

impl DeliveryPayload {
    /// Size of the raw payload in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Inline { data } => data.len(),
            Self::Reference { size, .. } => *size,
        }
    }

    /// Returns true when the payload lives in the queue message.
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

/// One (event, target) pairing awaiting or undergoing transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Deterministic identity derived from `(event_id, target_id)`.
    pub id: DeliveryId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Type of the event, forwarded as a header.
    pub event_type: String,
    /// Destination target.
    pub target_id: TargetId,
    /// Subscription that caused this delivery.
    pub subscription_id: SubscriptionId,
    /// Destination URL captured at fan-out time.
    pub url: String,
    /// The payload, inline or by reference.
    pub payload: DeliveryPayload,
    /// Number of attempts already made.
    pub attempt: u32,
    /// Backoff applied before the current attempt. The next retry waits at
    /// least this long.
    #[serde(default)]
    pub last_delay: Duration,
    /// When the delivery was created.
    pub first_attempt_at: DateTime<Utc>,
    /// Earliest time of the next attempt.
    pub next_attempt_at: DateTime<Utc>,
    /// End of the retry window.
    pub deadline: DateTime<Utc>,
}

impl Delivery {
    /// Time remaining in the retry window at `now`.
    pub fn remaining_window(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.deadline - now
    }
}

/// A delivery that reached the terminal failure state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The delivery as it was when it was dead-lettered.
    pub delivery: Delivery,
    /// Human-readable reason.
    pub reason: String,
    /// Last HTTP status received from the target, if any.
    pub last_status: Option<u16>,
    /// When the delivery was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::{Bytes, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::*;

    #[test]
    fn delivery_id_is_deterministic() {
        let event_id = EventId::from("evt_123");
        let target_id = TargetId::new();

        let first = DeliveryId::derive(&event_id, target_id);
        let second = DeliveryId::derive(&EventId::from("evt_123"), target_id);
        assert_eq!(first, second);
    }

    #[test]
    fn delivery_id_differs_per_target() {
        let event_id = EventId::from("evt_123");

        assert_ne!(
            DeliveryId::derive(&event_id, TargetId::new()),
            DeliveryId::derive(&event_id, TargetId::new())
        );
    }

    #[test]
    fn payload_ref_is_content_addressed() {
        let a = PayloadRef::for_content(b"hello");
        let b = PayloadRef::for_content(b"hello");
        let c = PayloadRef::for_content(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 64);
        assert!(a.verifies(b"hello"));
        assert!(!a.verifies(b"hello!"));
    }

    #[test]
    fn inline_payload_serializes_as_base64() {
        let payload = DeliveryPayload::Inline { data: Bytes::from_static(b"\x00\xffraw") };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "inline");
        assert_eq!(json["data"], STANDARD.encode(b"\x00\xffraw"));

        let decoded: DeliveryPayload = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn filter_matches_listed_event_types_only() {
        let filter = Filter {
            id: FilterId::new(),
            events: vec!["order.created".to_string(), "order.paid".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(filter.matches("order.paid"));
        assert!(!filter.matches("order"));
        assert!(!filter.matches("order.refunded"));
    }
}
