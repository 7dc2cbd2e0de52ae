//! Cron expressions for repeatable jobs.
//!
//! Expressions use six fields with seconds first (`sec min hour dom mon dow`),
//! evaluated in an IANA timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron expression never fires: {0}")]
    NoUpcoming(String),
}

/// A parsed cron expression bound to a timezone.
///
/// Serializes as `{"expression": ..., "timezone": ...}` and re-parses on
/// deserialization, so a stored schedule is always usable.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    tz: Tz,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse an expression evaluated in UTC.
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;

        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: expression.to_string(),
            tz,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &str {
        self.tz.name()
    }

    /// The first firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.tz);
        let next = self.schedule.after(&after_tz).next()?;
        Some(next.with_timezone(&Utc))
    }

    /// Like [`next_after`](Self::next_after) but reports an exhausted
    /// schedule as an error.
    pub fn require_next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.next_after(after)
            .ok_or_else(|| CronError::NoUpcoming(self.expression.clone()))
    }

    pub fn validate(expression: &str) -> Result<(), CronError> {
        Schedule::from_str(expression)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;
        Ok(())
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("timezone", &self.tz.name())
            .finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.tz == other.tz
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Serialize, Deserialize)]
struct CronScheduleRepr {
    expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Serialize for CronSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CronScheduleRepr {
            expression: self.expression.clone(),
            timezone: self.tz.name().to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CronSchedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = CronScheduleRepr::deserialize(deserializer)?;
        CronSchedule::with_timezone(&repr.expression, &repr.timezone)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_cron_schedule_creation() {
        let schedule = CronSchedule::new("0 */15 * * * *").unwrap();
        assert_eq!(schedule.expression(), "0 */15 * * * *");
        assert_eq!(schedule.timezone(), "UTC");
    }

    #[test]
    fn test_invalid_cron_expression() {
        assert!(matches!(
            CronSchedule::new("invalid cron"),
            Err(CronError::InvalidExpression(_))
        ));
        assert!(CronSchedule::validate("0 */1 * * * *").is_ok());
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(matches!(
            CronSchedule::with_timezone("0 0 9 * * *", "Invalid/Timezone"),
            Err(CronError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let schedule = CronSchedule::new("0 */15 * * * *").unwrap();
        let on_the_mark = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();

        let next = schedule.next_after(on_the_mark).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_next_after_in_timezone() {
        // 09:00 in New York during EST is 14:00 UTC.
        let schedule = CronSchedule::with_timezone("0 0 9 * * *", "America/New_York").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next.hour(), 14);
    }

    #[test]
    fn test_serde_reparses() {
        let schedule = CronSchedule::with_timezone("0 */1 * * * *", "Europe/Berlin").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let back: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);

        let bad = serde_json::from_str::<CronSchedule>(r#"{"expression":"nope"}"#);
        assert!(bad.is_err());
    }
}
