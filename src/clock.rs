//! Time sources for the queue and worker.
//!
//! Everything that compares against "now" (delayed job eligibility, dedup
//! expiry, pause windows, cron materialization) reads it from a [`Clock`], so
//! tests can drive time deterministically with [`MockClock`].

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock.
///
/// Clones share the same underlying instant, so a test can hand one clone to a
/// queue and keep another to advance time.
///
/// ```rust
/// use ferrywork::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::hours(1));
/// assert_eq!((clock.now() - start).num_hours(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Create a mock clock frozen at `time`.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::days(1));
        clock.advance(Duration::minutes(30));

        assert_eq!((clock.now() - start).num_minutes(), 24 * 60 + 30);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let handle = clock.clone();

        handle.advance(Duration::seconds(45));

        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 45).unwrap()
        );
    }

    #[test]
    fn test_set_time() {
        let clock = MockClock::new();
        let target = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        clock.set_time(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
