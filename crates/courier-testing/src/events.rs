//! Event handler that records delivery lifecycle events for assertions.

use std::sync::Arc;

use courier_core::{DeliveryEvent, DeliveryId, EventHandler};
use tokio::sync::Mutex;

/// Records every [`DeliveryEvent`] it receives. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventHandler {
    events: Arc<Mutex<Vec<DeliveryEvent>>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in arrival order.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().await.clone()
    }

    /// Events concerning one delivery.
    pub async fn events_for(&self, delivery_id: DeliveryId) -> Vec<DeliveryEvent> {
        let events = self.events.lock().await;
        events.iter().filter(|e| e.delivery_id() == delivery_id).cloned().collect()
    }

    /// Number of `Succeeded` events.
    pub async fn succeeded(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Succeeded(_))).await
    }

    /// Number of `RetryScheduled` events.
    pub async fn retries(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::RetryScheduled(_))).await
    }

    /// Number of `DeadLettered` events.
    pub async fn dead_lettered(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::DeadLettered(_))).await
    }

    /// Forgets everything recorded so far.
    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }

    async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}
