//! Backoff policies for failed jobs.
//!
//! A policy maps the number of attempts a job has already used to the delay
//! before it becomes eligible again. Delays never decrease as attempts grow.
//!
//! ```rust
//! use ferrywork::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::exponential(Duration::from_millis(1000));
//! assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
//! assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the doubling exponent so the multiplication cannot overflow.
const MAX_EXPONENT: u32 = 31;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed {
        #[serde(with = "crate::config::duration_str")]
        delay: Duration,
    },

    /// `delay * 2^(attempts - 1)`, optionally capped.
    Exponential {
        #[serde(with = "crate::config::duration_str")]
        delay: Duration,
        #[serde(
            default,
            with = "crate::config::duration_str::option",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<Duration>,
    },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    pub fn exponential(delay: Duration) -> Self {
        BackoffPolicy::Exponential {
            delay,
            max_delay: None,
        }
    }

    /// Cap exponential growth at `max_delay`. No effect on fixed policies.
    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        match self {
            BackoffPolicy::Exponential { delay, .. } => BackoffPolicy::Exponential {
                delay,
                max_delay: Some(max_delay),
            },
            fixed => fixed,
        }
    }

    /// Delay before the next attempt, given how many attempts have been made.
    ///
    /// `attempts` is 1-based: the delay after the first failure is
    /// `delay_for(1)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { delay, max_delay } => {
                let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
                let grown = delay.saturating_mul(1u32 << exponent);
                match max_delay {
                    Some(max) => grown.min(*max),
                    None => grown,
                }
            }
        };

        // Never schedule a retry for "right now".
        delay.max(Duration::from_millis(1))
    }

    pub fn base_delay(&self) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } | BackoffPolicy::Exponential { delay, .. } => *delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::exponential(Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_from_base() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1000));
        let delays: Vec<u128> = (1..=4).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_exponential_is_non_decreasing() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(250));
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            previous = delay;
        }
    }

    #[test]
    fn test_exponential_respects_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(7), Duration::from_secs(30));
        // Capping is an exponential concern only.
        assert_eq!(
            policy.with_max_delay(Duration::from_secs(1)).delay_for(2),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_zero_delay_is_clamped() {
        let policy = BackoffPolicy::fixed(Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
    }

    #[test]
    fn test_policy_json_shape() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1500));
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["type"], "exponential");
        assert_eq!(json["delay"], "1500ms");

        let parsed: BackoffPolicy =
            serde_json::from_str(r#"{"type":"fixed","delay":"2s"}"#).unwrap();
        assert_eq!(parsed, BackoffPolicy::fixed(Duration::from_secs(2)));
    }
}
