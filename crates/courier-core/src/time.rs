//! Clock abstraction for deterministic time control.
//!
//! Visibility timeouts, retry windows and cache refresh all read time
//! through [`Clock`], so tests can drive hours of retry schedule in
//! microseconds with [`TestClock`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Source of time for every time-dependent component.
///
/// Production code uses `RealClock`; tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time, for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Waits for `duration`.
    ///
    /// In production this maps to `tokio::time::sleep`; the test clock
    /// advances virtual time instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates the clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock that only moves when told to.
///
/// Both readings derive from one shared offset, so monotonic and wall time
/// never disagree, and clones handed to the engine observe every advance
/// made from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    origin_instant: Instant,
    origin_system: SystemTime,
}

impl TestClock {
    /// Clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock whose wall time starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            origin_instant: Instant::now(),
            origin_system: SystemTime::from(start),
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Moves time forward to `time`. Timestamps not in the future are
    /// ignored; the clock never runs backwards.
    pub fn advance_to(&self, time: DateTime<Utc>) {
        if let Ok(gap) = (time - self.now_utc()).to_std() {
            self.advance(gap);
        }
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.origin_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn advance_moves_both_readings_together() {
        let clock = TestClock::starting_at(fixed_start());
        let instant = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), fixed_start() + chrono::Duration::seconds(90));
    }

    #[test]
    fn clones_observe_the_same_time() {
        let clock = TestClock::new();
        let handed_to_engine: Arc<dyn Clock> = Arc::new(clock.clone());
        let before = handed_to_engine.now_utc();

        clock.advance(Duration::from_secs(3600));

        assert_eq!(handed_to_engine.now_utc() - before, chrono::Duration::hours(1));
    }

    #[test]
    fn advance_to_never_runs_backwards() {
        let clock = TestClock::starting_at(fixed_start());

        clock.advance_to(fixed_start() - chrono::Duration::minutes(5));
        assert_eq!(clock.now_utc(), fixed_start());
        assert_eq!(clock.elapsed(), Duration::ZERO);

        let retry_due = fixed_start() + chrono::Duration::seconds(30);
        clock.advance_to(retry_due);
        assert_eq!(clock.now_utc(), retry_due);
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }
}
