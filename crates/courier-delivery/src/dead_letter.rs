//! Terminal sink for deliveries that will never be attempted again.

use std::{future::Future, pin::Pin, sync::Arc};

use courier_core::{storage::Storage, DeadLetter};

use crate::error::{DeliveryError, Result};

/// Destination for dead-lettered deliveries.
///
/// Recording the same delivery twice must be harmless; a duplicated queue
/// message can dead-letter a delivery more than once.
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Records a dead letter.
    fn record(
        &self,
        dead_letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Dead-letter sink backed by the `dead_letters` table.
pub struct PostgresDeadLetterSink {
    storage: Arc<Storage>,
}

impl PostgresDeadLetterSink {
    /// Creates a sink over the given storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeadLetterSink for PostgresDeadLetterSink {
    fn record(
        &self,
        dead_letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .dead_letters
                .insert(&dead_letter)
                .await
                .map_err(|e| DeliveryError::database(e.to_string()))
        })
    }
}

pub mod memory {
    //! In-memory dead-letter sink for tests and single-node runs.

    use std::{future::Future, pin::Pin, sync::Arc};

    use courier_core::{DeadLetter, DeliveryId};
    use tokio::sync::RwLock;

    use super::DeadLetterSink;
    use crate::error::{DeliveryError, Result};

    #[derive(Debug, Default)]
    struct State {
        entries: Vec<DeadLetter>,
        fail_next: Option<String>,
    }

    /// Sink keeping dead letters in insertion order, one per delivery.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryDeadLetterSink {
        state: Arc<RwLock<State>>,
    }

    impl InMemoryDeadLetterSink {
        /// Creates an empty sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// All recorded dead letters.
        pub async fn entries(&self) -> Vec<DeadLetter> {
            self.state.read().await.entries.clone()
        }

        /// The dead letter recorded for `delivery_id`, if any.
        pub async fn find(&self, delivery_id: DeliveryId) -> Option<DeadLetter> {
            self.state.read().await.entries.iter().find(|e| e.delivery.id == delivery_id).cloned()
        }

        /// Number of distinct dead-lettered deliveries.
        pub async fn len(&self) -> usize {
            self.state.read().await.entries.len()
        }

        /// Returns true when nothing has been dead-lettered.
        pub async fn is_empty(&self) -> bool {
            self.state.read().await.entries.is_empty()
        }

        /// Makes the next `record` fail.
        pub async fn fail_next(&self, message: impl Into<String>) {
            self.state.write().await.fail_next = Some(message.into());
        }
    }

    impl DeadLetterSink for InMemoryDeadLetterSink {
        fn record(
            &self,
            dead_letter: DeadLetter,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.fail_next.take() {
                    return Err(DeliveryError::database(message));
                }

                let id = dead_letter.delivery.id;
                match state.entries.iter_mut().find(|e| e.delivery.id == id) {
                    Some(existing) => *existing = dead_letter,
                    None => state.entries.push(dead_letter),
                }
                Ok(())
            })
        }
    }
}
