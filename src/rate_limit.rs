//! Throttling for workers.
//!
//! Two independent mechanisms:
//!
//! - [`PauseWindow`] is reactive. When a downstream API answers "retry after
//!   N seconds" the worker stops pulling jobs until the window elapses. A new
//!   signal extends the window to the later deadline and never stacks.
//! - [`RateLimiter`] is proactive: a token bucket that caps how many jobs a
//!   worker starts per time window.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Deadline before which a worker must not dequeue.
#[derive(Debug, Default)]
pub struct PauseWindow {
    paused_until: Mutex<Option<DateTime<Utc>>>,
}

impl PauseWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause until `until`, or keep the current deadline if it is later.
    /// Returns the effective deadline.
    pub fn extend(&self, until: DateTime<Utc>) -> DateTime<Utc> {
        let mut paused_until = self
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let effective = match *paused_until {
            Some(current) if current >= until => current,
            _ => until,
        };
        *paused_until = Some(effective);
        effective
    }

    /// Time left in the window, or `None` once it has elapsed. An elapsed
    /// window is cleared.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let mut paused_until = self
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *paused_until {
            Some(until) if until > now => (until - now).to_std().ok(),
            Some(_) => {
                *paused_until = None;
                None
            }
            None => None,
        }
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some()
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        *self
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn clear(&self) {
        *self
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// At most `max` operations per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u64,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max: u64, per: Duration) -> Self {
        Self { max, per }
    }

    pub fn per_second(max: u64) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    pub fn per_minute(max: u64) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    fn refill_rate_per_ms(&self) -> f64 {
        self.max as f64 / (self.per.as_millis().max(1)) as f64
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per millisecond.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + self.refill_rate * elapsed.as_millis() as f64).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            let ms_needed = ((1.0 - self.tokens) / self.refill_rate).ceil() as u64;
            Duration::from_millis(ms_needed.max(1))
        }
    }
}

/// Token bucket shared by clones.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    rate_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(rate_limit: RateLimit) -> Self {
        let bucket = TokenBucket::new(rate_limit.max as f64, rate_limit.refill_rate_per_ms());
        Self {
            bucket: Arc::new(Mutex::new(bucket)),
            rate_limit,
        }
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .try_consume()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if bucket.try_consume() {
                    return;
                }
                bucket.time_until_token()
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_pause_window_extends_to_later_deadline() {
        let window = PauseWindow::new();
        assert!(!window.is_paused(at(0)));

        assert_eq!(window.extend(at(30)), at(30));
        // An earlier deadline does not shorten the pause.
        assert_eq!(window.extend(at(10)), at(30));
        // A later one extends it, without adding the two together.
        assert_eq!(window.extend(at(45)), at(45));

        assert_eq!(window.remaining(at(15)), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_pause_window_clears_after_elapsing() {
        let window = PauseWindow::new();
        window.extend(at(30));

        assert!(window.is_paused(at(29)));
        assert!(!window.is_paused(at(30)));
        assert_eq!(window.paused_until(), None);
    }

    #[test]
    fn test_try_acquire_respects_capacity() {
        let limiter = RateLimiter::new(RateLimit::new(2, Duration::from_secs(3600)));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimit::new(10, Duration::from_millis(1000)));
        let start = Instant::now();
        for _ in 0..11 {
            limiter.acquire().await;
        }
        // The eleventh token needs one refill interval of 100ms.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_clones_share_bucket() {
        let limiter = RateLimiter::new(RateLimit::per_minute(1));
        let clone = limiter.clone();
        assert!(limiter.try_acquire());
        assert!(!clone.try_acquire());
        assert_eq!(clone.rate_limit(), RateLimit::per_minute(1));
    }
}
