//! Read-optimized subscription index.
//!
//! Fan-out needs "which targets want events of this type" on every event.
//! The answer comes from an immutable [`CacheSnapshot`] that is rebuilt from
//! the registration store in the background and published with a single
//! pointer swap. Readers never lock and never see a half-built index.
//!
//! ```text
//!  registration store ──load_snapshot──▶ build index ──swap──▶ ArcSwap
//!        ▲                                                      │
//!        │ every refresh_interval / invalidate()                │ load()
//!  refresh loop                                          lookup(event_type)
//! ```
//!
//! Staleness is bounded by the refresh interval: a subscription deactivated
//! just after a refresh keeps matching until the next one.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use courier_core::{
    storage::Storage, Clock, CoreError, Filter, FilterId, RegistrationSnapshot, SubscriptionId,
    Target, TargetId,
};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Future returned by [`RegistrationSource::load_snapshot`].
pub type LoadFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<RegistrationSnapshot, CoreError>> + Send + 'a>>;

/// Source of registration records for the cache.
pub trait RegistrationSource: Send + Sync + 'static {
    /// Reads all targets, filters and subscriptions.
    fn load_snapshot(&self) -> LoadFuture<'_>;
}

/// Registration source reading the registration tables.
pub struct PostgresRegistrationSource {
    storage: Arc<Storage>,
}

impl PostgresRegistrationSource {
    /// Creates a source over the given storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl RegistrationSource for PostgresRegistrationSource {
    fn load_snapshot(&self) -> LoadFuture<'_> {
        Box::pin(async move { self.storage.registrations.load_snapshot().await })
    }
}

/// One eligible destination for an event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetMatch {
    /// Matched target.
    pub target_id: TargetId,
    /// Target URL at snapshot time.
    pub url: String,
    /// Subscription that produced the match.
    pub subscription_id: SubscriptionId,
}

/// Immutable index from event type to eligible targets.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Monotonic snapshot version. Zero means nothing has been loaded yet.
    pub version: u64,
    /// When the snapshot was built.
    pub built_at: Option<DateTime<Utc>>,
    index: HashMap<String, Vec<TargetMatch>>,
}

impl CacheSnapshot {
    /// Builds an index from a registration snapshot.
    ///
    /// Only active subscriptions whose target and filter both exist are
    /// indexed. A target appears at most once per event type; when several
    /// subscriptions bind it, the first by subscription id wins.
    pub fn build(
        registrations: &RegistrationSnapshot,
        version: u64,
        built_at: DateTime<Utc>,
    ) -> Self {
        let targets: HashMap<TargetId, &Target> =
            registrations.targets.iter().map(|t| (t.id, t)).collect();
        let filters: HashMap<FilterId, &Filter> =
            registrations.filters.iter().map(|f| (f.id, f)).collect();

        let mut subscriptions: Vec<_> =
            registrations.subscriptions.iter().filter(|s| s.active).collect();
        subscriptions.sort_by_key(|s| s.id);

        let mut index: HashMap<String, Vec<TargetMatch>> = HashMap::new();
        let mut seen: HashSet<(&str, TargetId)> = HashSet::new();

        for subscription in subscriptions {
            let Some(target) = targets.get(&subscription.target_id) else {
                warn!(
                    subscription_id = %subscription.id,
                    target_id = %subscription.target_id,
                    "subscription references unknown target, skipping"
                );
                continue;
            };
            let Some(filter) = filters.get(&subscription.filter_id) else {
                warn!(
                    subscription_id = %subscription.id,
                    filter_id = %subscription.filter_id,
                    "subscription references unknown filter, skipping"
                );
                continue;
            };

            for event_type in &filter.events {
                if !seen.insert((event_type.as_str(), target.id)) {
                    continue;
                }
                index.entry(event_type.clone()).or_default().push(TargetMatch {
                    target_id: target.id,
                    url: target.url.clone(),
                    subscription_id: subscription.id,
                });
            }
        }

        Self { version, built_at: Some(built_at), index }
    }

    /// Targets eligible for `event_type`.
    pub fn lookup(&self, event_type: &str) -> &[TargetMatch] {
        self.index.get(event_type).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of indexed event types.
    pub fn event_type_count(&self) -> usize {
        self.index.len()
    }
}

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Interval between background refreshes.
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { refresh_interval: Duration::from_secs(30) }
    }
}

/// Subscription cache with lock-free reads.
pub struct SubscriptionCache {
    source: Arc<dyn RegistrationSource>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    snapshot: ArcSwap<CacheSnapshot>,
    refresh_lock: Mutex<()>,
    invalidated: Notify,
}

impl SubscriptionCache {
    /// Creates an empty cache. Call [`refresh`](Self::refresh) before
    /// serving traffic.
    pub fn new(
        source: Arc<dyn RegistrationSource>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            source,
            clock,
            config,
            snapshot: ArcSwap::from_pointee(CacheSnapshot::default()),
            refresh_lock: Mutex::new(()),
            invalidated: Notify::new(),
        }
    }

    /// Targets eligible for `event_type` in the current snapshot.
    pub fn lookup(&self, event_type: &str) -> Vec<TargetMatch> {
        self.snapshot.load().lookup(event_type).to_vec()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.load_full()
    }

    /// Whether at least one snapshot has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.snapshot.load().version > 0
    }

    /// Rebuilds the index and publishes it. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns error if the registration source fails; the previous snapshot
    /// stays in place.
    pub async fn refresh(&self) -> Result<u64> {
        let _guard = self.refresh_lock.lock().await;

        let registrations = self
            .source
            .load_snapshot()
            .await
            .map_err(|e| DeliveryError::database(e.to_string()))?;

        let version = self.snapshot.load().version + 1;
        let snapshot = CacheSnapshot::build(&registrations, version, self.clock.now_utc());
        let event_types = snapshot.event_type_count();
        self.snapshot.store(Arc::new(snapshot));

        debug!(version, event_types, "subscription cache refreshed");
        Ok(version)
    }

    /// Wakes the refresh loop for an immediate rebuild.
    pub fn invalidate(&self) {
        self.invalidated.notify_one();
    }

    /// Refreshes on every interval tick or invalidation until cancelled.
    ///
    /// Failed refreshes are logged and the last good snapshot keeps serving.
    pub async fn run_refresh_loop(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!(
            refresh_interval_ms = self.config.refresh_interval.as_millis(),
            "subscription cache refresher starting"
        );

        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => break,
                () = tokio::time::sleep(self.config.refresh_interval) => {},
                () = self.invalidated.notified() => {},
            }

            if let Err(e) = self.refresh().await {
                warn!(
                    error = %e,
                    version = self.snapshot.load().version,
                    "subscription cache refresh failed, serving previous snapshot"
                );
            }
        }

        info!("subscription cache refresher stopped");
    }
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("version", &self.snapshot.load().version)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub mod memory {
    //! In-memory registration source for tests and single-node runs.

    use std::sync::Arc;

    use chrono::Utc;
    use courier_core::{
        CoreError, Filter, FilterId, RegistrationSnapshot, Subscription, SubscriptionId, Target,
        TargetId,
    };
    use tokio::sync::RwLock;

    use super::{LoadFuture, RegistrationSource};

    #[derive(Debug, Default)]
    struct State {
        snapshot: RegistrationSnapshot,
        fail_next_load: Option<String>,
        loads: usize,
    }

    /// Mutable registration store standing in for the registration API.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryRegistrationSource {
        state: Arc<RwLock<State>>,
    }

    impl InMemoryRegistrationSource {
        /// Creates an empty source.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a target.
        pub async fn add_target(&self, url: impl Into<String>) -> Target {
            let now = Utc::now();
            let target =
                Target { id: TargetId::new(), url: url.into(), created_at: now, updated_at: now };
            self.state.write().await.snapshot.targets.push(target.clone());
            target
        }

        /// Creates a filter over `events`.
        pub async fn add_filter<I, S>(&self, events: I) -> Filter
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let now = Utc::now();
            let filter = Filter {
                id: FilterId::new(),
                events: events.into_iter().map(Into::into).collect(),
                created_at: now,
                updated_at: now,
            };
            self.state.write().await.snapshot.filters.push(filter.clone());
            filter
        }

        /// Binds a target to a filter with an active subscription.
        pub async fn subscribe(&self, target_id: TargetId, filter_id: FilterId) -> Subscription {
            let now = Utc::now();
            let subscription = Subscription {
                id: SubscriptionId::new(),
                target_id,
                filter_id,
                active: true,
                created_at: now,
                updated_at: now,
            };
            self.state.write().await.snapshot.subscriptions.push(subscription.clone());
            subscription
        }

        /// Activates or deactivates a subscription.
        pub async fn set_active(&self, subscription_id: SubscriptionId, active: bool) {
            let mut state = self.state.write().await;
            if let Some(subscription) =
                state.snapshot.subscriptions.iter_mut().find(|s| s.id == subscription_id)
            {
                subscription.active = active;
                subscription.updated_at = Utc::now();
            }
        }

        /// Deletes a target, leaving its subscriptions dangling.
        pub async fn remove_target(&self, target_id: TargetId) {
            self.state.write().await.snapshot.targets.retain(|t| t.id != target_id);
        }

        /// Makes the next load fail.
        pub async fn fail_next_load(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_load = Some(message.into());
        }

        /// Number of load attempts, failed ones included.
        pub async fn load_count(&self) -> usize {
            self.state.read().await.loads
        }
    }

    impl RegistrationSource for InMemoryRegistrationSource {
        fn load_snapshot(&self) -> LoadFuture<'_> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.loads += 1;
                if let Some(message) = state.fail_next_load.take() {
                    return Err(CoreError::Database(message));
                }
                Ok(state.snapshot.clone())
            })
        }
    }
}
