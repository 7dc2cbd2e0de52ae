use crate::retry::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" | "wait" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "delayed" => Ok(JobStatus::Delayed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// How many finished jobs a queue keeps around for inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeepJobs {
    /// Maximum age in seconds. `None` keeps jobs regardless of age.
    #[serde(default)]
    pub age: Option<u64>,
    /// Maximum number of jobs. `None` keeps any number.
    #[serde(default)]
    pub count: Option<usize>,
}

impl KeepJobs {
    pub fn new(age: Option<u64>, count: Option<usize>) -> Self {
        Self { age, count }
    }

    pub fn count(count: usize) -> Self {
        Self {
            age: None,
            count: Some(count),
        }
    }
}

/// Defaults applied to every job a producer enqueues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            remove_on_complete: KeepJobs::new(Some(3600), Some(1000)),
            remove_on_fail: KeepJobs::count(5000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Job name, used for logging and to tie repeat occurrences to their
    /// registration.
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Key of the repeatable registration this job is an occurrence of.
    #[serde(default)]
    pub repeat_key: Option<String>,
}

impl Job {
    pub fn new(queue_name: impl Into<String>, name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        let options = JobOptions::default();
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            name: name.into(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            finished_at: None,
            error_message: None,
            repeat_key: None,
        }
    }

    pub fn with_options(mut self, options: &JobOptions) -> Self {
        self.max_attempts = options.max_attempts;
        self.backoff = options.backoff;
        self.remove_on_complete = options.remove_on_complete;
        self.remove_on_fail = options.remove_on_fail;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Stamp creation and eligibility with `now`, for queues driven by a
    /// non-wall clock.
    pub fn created_at(mut self, now: DateTime<Utc>) -> Self {
        self.created_at = now;
        self.scheduled_at = now;
        self
    }

    /// Make the job eligible `delay` after its creation time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.scheduled_at = add_duration(self.created_at, delay);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::FerryworkError::InvalidJobPayload {
                message: format!("job {} ({}): {}", self.id, self.name, e),
            }
        })
    }
}

/// `at + duration`, saturating at the latest representable instant.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
