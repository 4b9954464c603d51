//! Payload store for oversized event payloads.
//!
//! Payloads above the inline threshold are written once at fan-out time and
//! referenced from every delivery of the event. Keys are content addressed,
//! so a repeated `put` of the same bytes after a redelivered event is a
//! harmless overwrite and `get` can verify what it read.
//!
//! Every `put` restarts the blob's retention clock. A sweep may only delete
//! blobs last put before `now - (retry window + visibility timeout)`; see
//! [`retention_cutoff`].

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{storage::Storage, Clock, CoreError, PayloadRef};
use thiserror::Error;

/// Errors returned by payload store adapters.
///
/// All of them are treated as transient by the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    /// No blob exists under the key.
    #[error("payload {key} not found")]
    NotFound {
        /// Missing key
        key: PayloadRef,
    },

    /// The stored bytes do not hash to their key.
    #[error("payload {key} failed integrity check")]
    Corrupted {
        /// Key whose content did not verify
        key: PayloadRef,
    },

    /// The store could not be reached.
    #[error("payload store unavailable: {message}")]
    Unavailable {
        /// Underlying error message
        message: String,
    },
}

/// Oldest `put` time a blob may have and still be referenced by a live
/// delivery.
pub fn retention_cutoff(
    now: DateTime<Utc>,
    retry_window: Duration,
    visibility_timeout: Duration,
) -> DateTime<Utc> {
    chrono::Duration::from_std(retry_window.saturating_add(visibility_timeout))
        .ok()
        .and_then(|retained| now.checked_sub_signed(retained))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl From<CoreError> for PayloadError {
    fn from(err: CoreError) -> Self {
        Self::Unavailable { message: err.to_string() }
    }
}

/// Blob storage for payloads that do not fit in a queue message.
pub trait PayloadStore: Send + Sync + 'static {
    /// Stores `content` and returns its reference.
    fn put(
        &self,
        content: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PayloadRef, PayloadError>> + Send + '_>>;

    /// Fetches the content stored under `key`.
    fn get<'a>(
        &'a self,
        key: &'a PayloadRef,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, PayloadError>> + Send + 'a>>;

    /// Deletes blobs last put before `cutoff` and returns how many went.
    fn delete_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PayloadError>> + Send + '_>>;
}

/// Production payload store backed by the `payloads` table.
pub struct PostgresPayloadStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresPayloadStore {
    /// Creates a payload store over the given storage.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl PayloadStore for PostgresPayloadStore {
    fn put(
        &self,
        content: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PayloadRef, PayloadError>> + Send + '_>> {
        Box::pin(async move {
            let key = PayloadRef::for_content(&content);
            self.storage.payloads.put(&key, &content, self.clock.now_utc()).await?;
            Ok(key)
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a PayloadRef,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, PayloadError>> + Send + 'a>> {
        Box::pin(async move {
            let content = self
                .storage
                .payloads
                .get(key)
                .await?
                .ok_or_else(|| PayloadError::NotFound { key: key.clone() })?;

            if !key.verifies(&content) {
                return Err(PayloadError::Corrupted { key: key.clone() });
            }

            Ok(Bytes::from(content))
        })
    }

    fn delete_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PayloadError>> + Send + '_>> {
        Box::pin(async move { Ok(self.storage.payloads.delete_created_before(cutoff).await?) })
    }
}

pub mod memory {
    //! In-memory payload store with failure injection.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use courier_core::{Clock, PayloadRef, RealClock};
    use tokio::sync::RwLock;

    use super::{PayloadError, PayloadStore};

    #[derive(Debug)]
    struct Blob {
        content: Bytes,
        created_at: DateTime<Utc>,
    }

    #[derive(Debug, Default)]
    struct State {
        blobs: HashMap<PayloadRef, Blob>,
        put_count: usize,
        fail_next_put: Option<String>,
        fail_next_get: Option<String>,
    }

    /// Payload store keeping blobs in a hash map.
    #[derive(Debug, Clone)]
    pub struct InMemoryPayloadStore {
        state: Arc<RwLock<State>>,
        clock: Arc<dyn Clock>,
    }

    impl Default for InMemoryPayloadStore {
        fn default() -> Self {
            Self { state: Arc::default(), clock: Arc::new(RealClock::new()) }
        }
    }

    impl InMemoryPayloadStore {
        /// Creates an empty store stamping blobs with the real clock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Stamps blobs with `clock` instead.
        #[must_use]
        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        /// Number of distinct blobs held.
        pub async fn len(&self) -> usize {
            self.state.read().await.blobs.len()
        }

        /// Returns true when no blobs are held.
        pub async fn is_empty(&self) -> bool {
            self.state.read().await.blobs.is_empty()
        }

        /// Number of `put` calls that succeeded, including overwrites.
        pub async fn put_count(&self) -> usize {
            self.state.read().await.put_count
        }

        /// Deletes a blob, simulating lifecycle expiry.
        pub async fn remove(&self, key: &PayloadRef) -> Option<Bytes> {
            self.state.write().await.blobs.remove(key).map(|blob| blob.content)
        }

        /// Makes the next `put` fail.
        pub async fn fail_next_put(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_put = Some(message.into());
        }

        /// Makes the next `get` fail.
        pub async fn fail_next_get(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_get = Some(message.into());
        }
    }

    impl PayloadStore for InMemoryPayloadStore {
        fn put(
            &self,
            content: Bytes,
        ) -> Pin<Box<dyn Future<Output = Result<PayloadRef, PayloadError>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.fail_next_put.take() {
                    return Err(PayloadError::Unavailable { message });
                }

                let key = PayloadRef::for_content(&content);
                let now = self.clock.now_utc();
                state
                    .blobs
                    .entry(key.clone())
                    .and_modify(|blob| blob.created_at = blob.created_at.max(now))
                    .or_insert(Blob { content, created_at: now });
                state.put_count += 1;
                Ok(key)
            })
        }

        fn get<'a>(
            &'a self,
            key: &'a PayloadRef,
        ) -> Pin<Box<dyn Future<Output = Result<Bytes, PayloadError>> + Send + 'a>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.fail_next_get.take() {
                    return Err(PayloadError::Unavailable { message });
                }

                state
                    .blobs
                    .get(key)
                    .map(|blob| blob.content.clone())
                    .ok_or_else(|| PayloadError::NotFound { key: key.clone() })
            })
        }

        fn delete_created_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64, PayloadError>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let before = state.blobs.len();
                state.blobs.retain(|_, blob| blob.created_at >= cutoff);
                Ok((before - state.blobs.len()) as u64)
            })
        }
    }
}
