//! Per-target circuit breakers.
//!
//! A target that keeps timing out or answering 5xx gets its circuit opened.
//! While open, the dispatcher defers that target's deliveries instead of
//! spending HTTP calls and worker time on them. After `open_timeout` a few
//! trial requests are let through; enough successes close the circuit, any
//! failure opens it again.
//!
//! ```text
//! Closed   --(failure_threshold in a row, or failure rate)-->  Open
//! Open     --(open_timeout elapsed, on next admission)----->  HalfOpen
//! HalfOpen --(success_threshold successes)------------------>  Closed
//! HalfOpen --(any failure)---------------------------------->  Open
//! ```
//!
//! Only failures that say something about the target count (see
//! [`DeliveryError::is_target_failure`](crate::DeliveryError::is_target_failure));
//! a 4xx is a success here because the target answered.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, TargetId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Trip and recovery thresholds shared by every target's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Calls observed before the failure rate is considered.
    pub min_requests_for_rate: u32,
    /// Failure ratio in `[0, 1]` that opens a closed circuit.
    pub failure_rate_threshold: f64,
    /// Span over which the failure rate is measured. Counts start over
    /// when it elapses.
    pub rate_window: Duration,
    /// Time an open circuit waits before admitting trial requests.
    pub open_timeout: Duration,
    /// Half-open successes needed to close.
    pub success_threshold: u32,
    /// Trial calls admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            rate_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_requests: 3,
        }
    }
}

/// Position of a target's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Deliveries flow normally.
    Closed,
    /// Deliveries are deferred without a call.
    Open,
    /// A bounded number of trial requests are admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Snapshot of one target's circuit. Counters reset whenever the circuit
/// closes; `requests` and `failures` also reset every `rate_window`.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since entering half-open.
    pub consecutive_successes: u32,
    /// Calls recorded in the current rate window.
    pub requests: u32,
    /// Failed calls recorded in the current rate window.
    pub failures: u32,
    /// Start of the current rate window.
    pub window_started: Option<Instant>,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    /// Trial requests admitted since entering half-open.
    pub trials: u32,
}

impl CircuitStats {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            requests: 0,
            failures: 0,
            window_started: None,
            opened_at: None,
            trials: 0,
        }
    }

    /// Failed share of the calls in the current rate window.
    pub fn failure_rate(&self) -> f64 {
        match self.requests {
            0 => 0.0,
            n => f64::from(self.failures) / f64::from(n),
        }
    }

    fn admit(&mut self, target_id: TargetId, config: &CircuitConfig, now: Instant) -> bool {
        let expired = self
            .opened_at
            .is_some_and(|at| now.saturating_duration_since(at) >= config.open_timeout);
        if self.state == CircuitState::Open && expired {
            info!(%target_id, "circuit half-open, probing target");
            self.state = CircuitState::HalfOpen;
            self.trials = 0;
            self.consecutive_successes = 0;
        }

        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.trials < config.half_open_max_requests,
        }
    }

    fn roll_window(&mut self, config: &CircuitConfig, now: Instant) {
        let expired = self
            .window_started
            .map_or(true, |at| now.saturating_duration_since(at) >= config.rate_window);
        if expired {
            self.window_started = Some(now);
            self.requests = 0;
            self.failures = 0;
        }
    }

    fn succeed(&mut self, target_id: TargetId, config: &CircuitConfig, now: Instant) {
        self.roll_window(config, now);
        self.requests = self.requests.saturating_add(1);
        self.consecutive_failures = 0;

        if self.state == CircuitState::HalfOpen {
            self.trials += 1;
            self.consecutive_successes += 1;
            if self.consecutive_successes >= config.success_threshold {
                info!(%target_id, "circuit closed, target recovered");
                *self = Self::closed();
            }
        }
    }

    fn fail(&mut self, target_id: TargetId, config: &CircuitConfig, now: Instant) {
        self.roll_window(config, now);
        self.requests = self.requests.saturating_add(1);
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;

        let trip = match self.state {
            CircuitState::Closed => {
                self.consecutive_failures >= config.failure_threshold
                    || (self.requests >= config.min_requests_for_rate
                        && self.failure_rate() >= config.failure_rate_threshold)
            },
            CircuitState::HalfOpen => {
                self.trials += 1;
                true
            },
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                %target_id,
                consecutive_failures = self.consecutive_failures,
                failure_rate = self.failure_rate(),
                "circuit opened"
            );
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }
}

/// Circuits for every target, sharded by target id.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    circuits: DashMap<TargetId, CircuitStats>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, circuits: DashMap::new(), clock }
    }

    /// Whether a call to `target_id` may go out now. Half-opens an expired
    /// open circuit as a side effect.
    pub fn should_allow_request(&self, target_id: TargetId) -> bool {
        let now = self.clock.now();
        self.circuits
            .entry(target_id)
            .or_insert_with(CircuitStats::closed)
            .admit(target_id, &self.config, now)
    }

    /// Counts a successful call; closes a half-open circuit once enough succeed.
    pub fn record_success(&self, target_id: TargetId) {
        let now = self.clock.now();
        self.circuits
            .entry(target_id)
            .or_insert_with(CircuitStats::closed)
            .succeed(target_id, &self.config, now);
    }

    /// Counts a failed call; may open the circuit.
    pub fn record_failure(&self, target_id: TargetId) {
        let now = self.clock.now();
        self.circuits
            .entry(target_id)
            .or_insert_with(CircuitStats::closed)
            .fail(target_id, &self.config, now);
    }

    /// Snapshot of a target's circuit, if it has seen any traffic.
    pub fn circuit_stats(&self, target_id: TargetId) -> Option<CircuitStats> {
        self.circuits.get(&target_id).map(|stats| stats.clone())
    }

    /// Number of targets whose circuit is open.
    pub fn open_circuits(&self) -> usize {
        self.circuits.iter().filter(|entry| entry.state == CircuitState::Open).count()
    }

    /// Puts a circuit into `state` directly. Closing resets its counters;
    /// opening starts a fresh `open_timeout`.
    pub fn force_circuit_state(&self, target_id: TargetId, state: CircuitState) {
        let now = self.clock.now();
        let mut stats = self.circuits.entry(target_id).or_insert_with(CircuitStats::closed);

        match state {
            CircuitState::Closed => *stats = CircuitStats::closed(),
            CircuitState::Open => {
                stats.state = state;
                stats.opened_at = Some(now);
            },
            CircuitState::HalfOpen => {
                stats.state = state;
                stats.trials = 0;
                stats.consecutive_successes = 0;
            },
        }
    }
}
