//! Test data builders for events and ingestion envelopes.

use bytes::Bytes;
use courier_core::{EventId, WebhookEvent};
use rand::{distr::Alphanumeric, Rng};
use serde_json::{json, Value};

/// Random printable payload of exactly `size` bytes.
///
/// Printable so the same bytes can travel inside a JSON envelope.
pub fn payload_of_size(size: usize) -> Bytes {
    let bytes: Vec<u8> = rand::rng().sample_iter(Alphanumeric).take(size).collect();
    Bytes::from(bytes)
}

/// Builder for test events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_id: Option<String>,
    event_type: String,
    payload: Bytes,
}

impl EventBuilder {
    /// An `order.created` event with a small JSON payload and a fresh id.
    pub fn new() -> Self {
        Self {
            event_id: Some(EventId::generate().to_string()),
            event_type: "order.created".to_string(),
            payload: Bytes::from_static(br#"{"order_id":42}"#),
        }
    }

    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// Leaves the envelope without an id.
    #[must_use]
    pub fn without_id(mut self) -> Self {
        self.event_id = None;
        self
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the raw payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the payload to a serialized JSON value.
    #[must_use]
    pub fn json_payload(mut self, value: &Value) -> Self {
        self.payload = Bytes::from(value.to_string());
        self
    }

    /// Sets a random printable payload of `size` bytes.
    #[must_use]
    pub fn payload_size(mut self, size: usize) -> Self {
        self.payload = payload_of_size(size);
        self
    }

    /// Builds the event. An id left unset is generated.
    pub fn build(self) -> WebhookEvent {
        let event_id = self.event_id.map_or_else(EventId::generate, EventId::from);
        WebhookEvent::new(event_id, self.event_type, self.payload)
    }

    /// Builds the JSON envelope accepted by `POST /events`.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not UTF-8.
    pub fn envelope(&self) -> Value {
        let payload = std::str::from_utf8(&self.payload).expect("envelope payload must be UTF-8");
        let mut envelope = json!({ "event_type": self.event_type, "payload": payload });
        if let Some(id) = &self.event_id {
            envelope["event_id"] = json!(id);
        }
        envelope
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_requested_size() {
        assert_eq!(payload_of_size(0).len(), 0);
        assert_eq!(payload_of_size(5 * 1024).len(), 5 * 1024);
    }

    #[test]
    fn envelope_carries_payload_as_string() {
        let builder = EventBuilder::new().id("evt_1").payload("hello");

        let envelope = builder.envelope();

        assert_eq!(envelope["event_id"], "evt_1");
        assert_eq!(envelope["event_type"], "order.created");
        assert_eq!(envelope["payload"], "hello");
    }

    #[test]
    fn envelope_without_id_omits_field() {
        let envelope = EventBuilder::new().without_id().envelope();

        assert!(envelope.get("event_id").is_none());
    }

    #[test]
    fn built_event_keeps_id() {
        let event = EventBuilder::new().id("evt_7").event_type("blob").build();

        assert_eq!(event.event_id.as_str(), "evt_7");
        assert_eq!(event.event_type, "blob");
    }
}
