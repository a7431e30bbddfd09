//! Deterministic time control for reproducible tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use tidings_core::Clock;

/// Test clock with controllable UTC time.
///
/// `sleep` advances the virtual clock immediately instead of waiting,
/// so sweeps and retry waits run instantly under test.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Virtual time in milliseconds since the UNIX epoch.
    epoch_millis: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock pinned to a specific instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { epoch_millis: Arc::new(AtomicI64::new(start.timestamp_millis())) }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.epoch_millis.fetch_add(millis, Ordering::AcqRel);
    }

    /// Jumps the clock to a specific instant, forwards or backwards.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.epoch_millis.store(instant.timestamp_millis(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let millis = self.epoch_millis.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        // Yield so other tasks observe the new time before we resume.
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);

        clock.advance(Duration::from_secs(3600));

        assert_eq!(clock.now_utc(), start + chrono::Duration::hours(1));
    }

    #[test]
    fn clock_jumps_backwards() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);

        clock.set(earlier);

        assert_eq!(clock.now_utc(), earlier);
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);

        clock.sleep(Duration::from_secs(300)).await;

        assert_eq!(clock.now_utc(), start + chrono::Duration::minutes(5));
    }
}
