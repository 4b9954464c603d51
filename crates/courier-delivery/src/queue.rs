//! Lease-based dispatch queue.
//!
//! The dispatch queue is both the primary work queue and the retry
//! scheduler: a retry is simply an enqueue with a delay. Delivery is
//! at-least-once. A received message is leased for the visibility timeout;
//! if the lease is neither acked nor nacked before it lapses the message
//! becomes visible again and another worker picks it up.
//!
//! Messages are JSON encoded deliveries. Inline payloads are base64 inside
//! the JSON, so the encoded size, not the payload size, is what the
//! `max_message_bytes` limit applies to.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock, CoreError, Delivery};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::{delay_from, DEFAULT_MAX_MESSAGE_BYTES};

/// Errors returned by dispatch queue adapters.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The encoded delivery exceeds the transport limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },

    /// The lease lapsed and the message was leased again or removed.
    #[error("lease on message {message_id} has expired")]
    LeaseExpired {
        /// Message whose lease was presented
        message_id: Uuid,
    },

    /// A delivery could not be encoded or a message could not be decoded.
    #[error("message encoding failed: {message}")]
    Encode {
        /// Serializer error message
        message: String,
    },

    /// The backing store failed.
    #[error("queue storage failed: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

/// Handle proving ownership of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Queue-assigned message identifier.
    pub message_id: Uuid,
    /// Token issued by the receive that produced this lease.
    pub token: Uuid,
}

/// A delivery handed out by [`DispatchQueue::receive`].
#[derive(Debug, Clone)]
pub struct LeasedDelivery {
    /// The decoded delivery.
    pub delivery: Delivery,
    /// Lease required to ack or nack the message.
    pub lease: Lease,
    /// How many times the message has been received, including this one.
    pub receive_count: u32,
}

/// Queue operations required by fan-out, the dispatcher and the retry
/// manager.
pub trait DispatchQueue: Send + Sync + 'static {
    /// Enqueues a delivery that becomes visible after `delay`.
    fn enqueue(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Leases up to `max_batch` visible deliveries for `visibility_timeout`.
    fn receive(
        &self,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LeasedDelivery>, QueueError>> + Send + '_>>;

    /// Removes a leased message.
    fn ack(
        &self,
        lease: Lease,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Releases a leased message so it becomes visible immediately.
    fn nack(
        &self,
        lease: Lease,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Number of messages held by the queue, leased or not.
    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<usize, QueueError>> + Send + '_>>;
}

/// Encodes a delivery and enforces the transport size limit.
///
/// # Errors
///
/// Returns `Encode` if serialization fails and `MessageTooLarge` if the
/// encoded message exceeds `limit`.
pub fn encode_message(delivery: &Delivery, limit: usize) -> Result<Vec<u8>, QueueError> {
    let body =
        serde_json::to_vec(delivery).map_err(|e| QueueError::Encode { message: e.to_string() })?;

    if body.len() > limit {
        return Err(QueueError::MessageTooLarge { size: body.len(), limit });
    }

    Ok(body)
}

fn decode_message(body: &[u8]) -> Result<Delivery, QueueError> {
    serde_json::from_slice(body).map_err(|e| QueueError::Encode { message: e.to_string() })
}

/// Production dispatch queue backed by the `dispatch_queue` table.
pub struct PostgresDispatchQueue {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    max_message_bytes: usize,
}

impl PostgresDispatchQueue {
    /// Creates a queue adapter over the given storage.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock, max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES }
    }

    /// Overrides the maximum encoded message size.
    #[must_use]
    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }
}

impl DispatchQueue for PostgresDispatchQueue {
    fn enqueue(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let encoded = encode_message(delivery, self.max_message_bytes);
        let delivery_id = delivery.id;

        Box::pin(async move {
            let body = encoded?;
            let now = self.clock.now_utc();
            self.storage
                .dispatch_queue
                .enqueue(delivery_id, &body, delay_from(now, delay), now)
                .await?;
            Ok(())
        })
    }

    fn receive(
        &self,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LeasedDelivery>, QueueError>> + Send + '_>> {
        Box::pin(async move {
            let token = Uuid::new_v4();
            let messages = self
                .storage
                .dispatch_queue
                .receive(max_batch, visibility_timeout, token, self.clock.now_utc())
                .await?;

            let mut leased = Vec::with_capacity(messages.len());
            for message in messages {
                let lease = Lease { message_id: message.id, token };
                match decode_message(&message.body) {
                    Ok(delivery) => leased.push(LeasedDelivery {
                        delivery,
                        lease,
                        receive_count: u32::try_from(message.receive_count).unwrap_or(0),
                    }),
                    Err(e) => {
                        error!(
                            message_id = %message.id,
                            error = %e,
                            "discarding undecodable queue message"
                        );
                        self.storage.dispatch_queue.ack(message.id, token).await?;
                    },
                }
            }

            Ok(leased)
        })
    }

    fn ack(
        &self,
        lease: Lease,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            if self.storage.dispatch_queue.ack(lease.message_id, lease.token).await? {
                Ok(())
            } else {
                Err(QueueError::LeaseExpired { message_id: lease.message_id })
            }
        })
    }

    fn nack(
        &self,
        lease: Lease,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            if self.storage.dispatch_queue.nack(lease.message_id, lease.token, now).await? {
                Ok(())
            } else {
                Err(QueueError::LeaseExpired { message_id: lease.message_id })
            }
        })
    }

    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<usize, QueueError>> + Send + '_>> {
        Box::pin(async move {
            let depth = self.storage.dispatch_queue.depth().await?;
            Ok(usize::try_from(depth).unwrap_or(0))
        })
    }
}

pub mod memory {
    //! In-memory dispatch queue.
    //!
    //! Keeps encoded messages in a vector and reads time from the injected
    //! clock, so visibility timeouts and retry delays can be driven with a
    //! `TestClock`. Single process only.

    use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{Clock, Delivery};
    use tokio::sync::RwLock;
    use tracing::debug;
    use uuid::Uuid;

    use super::{decode_message, encode_message, DispatchQueue, Lease, LeasedDelivery, QueueError};
    use crate::{delay_from, DEFAULT_MAX_MESSAGE_BYTES};

    #[derive(Debug, Clone)]
    struct StoredMessage {
        id: Uuid,
        body: Vec<u8>,
        visible_at: DateTime<Utc>,
        lease_token: Option<Uuid>,
        receive_count: u32,
    }

    #[derive(Debug, Default)]
    struct State {
        messages: Vec<StoredMessage>,
        fail_next_enqueue: Option<String>,
        fail_next_receive: Option<String>,
        enqueued_total: u64,
    }

    /// Clock-driven in-memory queue.
    #[derive(Debug, Clone)]
    pub struct InMemoryDispatchQueue {
        state: Arc<RwLock<State>>,
        clock: Arc<dyn Clock>,
        max_message_bytes: usize,
    }

    impl InMemoryDispatchQueue {
        /// Creates an empty queue reading time from `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                state: Arc::new(RwLock::new(State::default())),
                clock,
                max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            }
        }

        /// Overrides the maximum encoded message size.
        #[must_use]
        pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
            self.max_message_bytes = max_message_bytes;
            self
        }

        /// Number of messages held, leased or not.
        pub async fn len(&self) -> usize {
            self.state.read().await.messages.len()
        }

        /// Returns true when the queue holds no messages.
        pub async fn is_empty(&self) -> bool {
            self.state.read().await.messages.is_empty()
        }

        /// Number of messages visible at the current clock time.
        pub async fn visible_len(&self) -> usize {
            let now = self.clock.now_utc();
            self.state.read().await.messages.iter().filter(|m| m.visible_at <= now).count()
        }

        /// Earliest time any held message becomes visible.
        pub async fn next_visible_at(&self) -> Option<DateTime<Utc>> {
            self.state.read().await.messages.iter().map(|m| m.visible_at).min()
        }

        /// Total number of successful enqueues since creation.
        pub async fn enqueued_total(&self) -> u64 {
            self.state.read().await.enqueued_total
        }

        /// Decoded copies of every held delivery, ordered by visibility.
        pub async fn deliveries(&self) -> Vec<Delivery> {
            let state = self.state.read().await;
            let mut messages = state.messages.clone();
            drop(state);

            messages.sort_by_key(|m| m.visible_at);
            messages.iter().filter_map(|m| decode_message(&m.body).ok()).collect()
        }

        /// Makes the next enqueue fail with a storage error.
        pub async fn fail_next_enqueue(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_enqueue = Some(message.into());
        }

        /// Makes the next receive fail with a storage error.
        pub async fn fail_next_receive(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_receive = Some(message.into());
        }
    }

    impl DispatchQueue for InMemoryDispatchQueue {
        fn enqueue(
            &self,
            delivery: &Delivery,
            delay: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
            let encoded = encode_message(delivery, self.max_message_bytes);
            let delivery_id = delivery.id;

            Box::pin(async move {
                let body = encoded?;
                let mut state = self.state.write().await;

                if let Some(message) = state.fail_next_enqueue.take() {
                    return Err(QueueError::Storage { message });
                }

                let visible_at = delay_from(self.clock.now_utc(), delay);
                state.messages.push(StoredMessage {
                    id: Uuid::new_v4(),
                    body,
                    visible_at,
                    lease_token: None,
                    receive_count: 0,
                });
                state.enqueued_total += 1;
                drop(state);

                debug!(delivery_id = %delivery_id, %visible_at, "delivery enqueued");
                Ok(())
            })
        }

        fn receive(
            &self,
            max_batch: usize,
            visibility_timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<LeasedDelivery>, QueueError>> + Send + '_>>
        {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let invisible_until = delay_from(now, visibility_timeout);
                let token = Uuid::new_v4();

                let mut state = self.state.write().await;

                if let Some(message) = state.fail_next_receive.take() {
                    return Err(QueueError::Storage { message });
                }

                let mut visible: Vec<usize> = state
                    .messages
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.visible_at <= now)
                    .map(|(index, _)| index)
                    .collect();
                visible.sort_by_key(|&index| state.messages[index].visible_at);
                visible.truncate(max_batch);

                let mut leased = Vec::with_capacity(visible.len());
                for index in visible {
                    let message = &mut state.messages[index];
                    message.lease_token = Some(token);
                    message.visible_at = invisible_until;
                    message.receive_count += 1;

                    leased.push(LeasedDelivery {
                        delivery: decode_message(&message.body)?,
                        lease: Lease { message_id: message.id, token },
                        receive_count: message.receive_count,
                    });
                }

                Ok(leased)
            })
        }

        fn ack(
            &self,
            lease: Lease,
        ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let position = state
                    .messages
                    .iter()
                    .position(|m| m.id == lease.message_id && m.lease_token == Some(lease.token));

                match position {
                    Some(index) => {
                        state.messages.swap_remove(index);
                        Ok(())
                    },
                    None => Err(QueueError::LeaseExpired { message_id: lease.message_id }),
                }
            })
        }

        fn nack(
            &self,
            lease: Lease,
        ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.write().await;
                let message = state
                    .messages
                    .iter_mut()
                    .find(|m| m.id == lease.message_id && m.lease_token == Some(lease.token));

                match message {
                    Some(message) => {
                        message.lease_token = None;
                        message.visible_at = now;
                        Ok(())
                    },
                    None => Err(QueueError::LeaseExpired { message_id: lease.message_id }),
                }
            })
        }

        fn depth(&self) -> Pin<Box<dyn Future<Output = Result<usize, QueueError>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.read().await.messages.len()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use courier_core::{
        DeliveryId, DeliveryPayload, EventId, SubscriptionId, TargetId, TestClock,
    };

    use super::{memory::InMemoryDispatchQueue, *};

    fn delivery_with_payload(size: usize) -> Delivery {
        let now = Utc::now();
        let event_id = EventId::from("evt_queue");
        let target_id = TargetId::new();
        Delivery {
            id: DeliveryId::derive(&event_id, target_id),
            event_id,
            event_type: "order.created".to_string(),
            target_id,
            subscription_id: SubscriptionId::new(),
            url: "https://example.com/hook".to_string(),
            payload: DeliveryPayload::Inline { data: Bytes::from(vec![b'x'; size]) },
            attempt: 0,
            last_delay: Duration::ZERO,
            first_attempt_at: now,
            next_attempt_at: now,
            deadline: now + chrono::Duration::hours(24),
        }
    }

    fn queue() -> (InMemoryDispatchQueue, TestClock) {
        let clock = TestClock::new();
        (InMemoryDispatchQueue::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn received_message_is_invisible_until_lease_lapses() {
        let (queue, clock) = queue();
        queue.enqueue(&delivery_with_payload(16), Duration::ZERO).await.unwrap();

        let first = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(10, Duration::from_secs(30)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(31));

        let second = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].delivery, first[0].delivery);
    }

    #[tokio::test]
    async fn stale_lease_cannot_ack_newer_lease() {
        let (queue, clock) = queue();
        queue.enqueue(&delivery_with_payload(16), Duration::ZERO).await.unwrap();

        let stale = queue.receive(1, Duration::from_secs(5)).await.unwrap().remove(0);
        clock.advance(Duration::from_secs(6));
        let fresh = queue.receive(1, Duration::from_secs(5)).await.unwrap().remove(0);

        let result = queue.ack(stale.lease).await;
        assert!(matches!(result, Err(QueueError::LeaseExpired { .. })));
        assert_eq!(queue.len().await, 1);

        queue.ack(fresh.lease).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn delayed_enqueue_postpones_visibility() {
        let (queue, clock) = queue();
        queue.enqueue(&delivery_with_payload(16), Duration::from_secs(60)).await.unwrap();

        assert_eq!(queue.visible_len().await, 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.visible_len().await, 1);
    }

    #[tokio::test]
    async fn nack_makes_message_visible_immediately() {
        let (queue, _clock) = queue();
        queue.enqueue(&delivery_with_payload(16), Duration::ZERO).await.unwrap();

        let leased = queue.receive(1, Duration::from_secs(300)).await.unwrap().remove(0);
        queue.nack(leased.lease).await.unwrap();

        assert_eq!(queue.receive(1, Duration::from_secs(300)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let (queue, _clock) = queue();
        let queue = queue.with_max_message_bytes(1024);

        let result = queue.enqueue(&delivery_with_payload(2048), Duration::ZERO).await;

        assert!(matches!(result, Err(QueueError::MessageTooLarge { limit: 1024, .. })));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn receive_respects_batch_size() {
        let (queue, _clock) = queue();
        for _ in 0..5 {
            queue.enqueue(&delivery_with_payload(8), Duration::ZERO).await.unwrap();
        }

        assert_eq!(queue.receive(3, Duration::from_secs(30)).await.unwrap().len(), 3);
        assert_eq!(queue.receive(3, Duration::from_secs(30)).await.unwrap().len(), 2);
        assert_eq!(queue.depth().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn injected_enqueue_failure_is_one_shot() {
        let (queue, _clock) = queue();
        queue.fail_next_enqueue("queue down").await;

        let delivery = delivery_with_payload(8);
        assert!(matches!(
            queue.enqueue(&delivery, Duration::ZERO).await,
            Err(QueueError::Storage { .. })
        ));
        queue.enqueue(&delivery, Duration::ZERO).await.unwrap();
        assert_eq!(queue.enqueued_total().await, 1);
    }
}
