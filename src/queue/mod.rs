//! Durable job queue with pluggable backends.
//!
//! The [`JobQueue`] trait owns the job lifecycle (`waiting -> active ->
//! completed | delayed | failed`), retention of finished jobs and repeatable
//! (cron) registrations. [`KeyValueStore`] is the small TTL cache interface
//! the dedup layer needs; both backends implement both traits so a single
//! store handle serves queues and the dedup cache.

use crate::{
    Result,
    cron::CronSchedule,
    job::{Job, JobId, JobOptions, JobStatus, KeepJobs},
    stats::{JobCounts, QueueStats},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryQueue;

/// How long a dequeued job stays claimed without a heartbeat before another
/// dequeue may take it back.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;

/// Declarative template for a job that runs on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepeatableJobSpec {
    pub name: String,
    pub payload: serde_json::Value,
    pub cron: CronSchedule,
}

impl RepeatableJobSpec {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, cron: CronSchedule) -> Self {
        Self {
            name: name.into(),
            payload,
            cron,
        }
    }

    /// Identity of a registration. Two registrations with the same name but a
    /// different schedule get different keys, which is why re-registering
    /// removes by name first.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.name,
            self.cron.expression(),
            self.cron.timezone()
        )
    }
}

/// A stored repeatable registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepeatableJob {
    pub key: String,
    pub queue_name: String,
    pub spec: RepeatableJobSpec,
    pub options: JobOptions,
    pub next_run_at: DateTime<Utc>,
    /// The delayed job materialized for `next_run_at`.
    pub next_job_id: JobId,
}

impl RepeatableJob {
    /// Build the registration and its first occurrence, due at the next cron
    /// time after `now`.
    pub fn materialize(
        queue_name: &str,
        spec: RepeatableJobSpec,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<(Self, Job)> {
        let next_run_at = spec.cron.require_next_after(now)?;
        let key = spec.key();
        let job = occurrence(queue_name, &key, &spec, options, now, next_run_at);
        Ok((
            Self {
                key,
                queue_name: queue_name.to_string(),
                spec,
                options: *options,
                next_run_at,
                next_job_id: job.id,
            },
            job,
        ))
    }

    /// Advance the registration past the occurrence that was just activated
    /// and return the next occurrence to store.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<Job> {
        let after = if self.next_run_at > now {
            self.next_run_at
        } else {
            now
        };
        let next_run_at = self.spec.cron.require_next_after(after)?;
        let job = occurrence(
            &self.queue_name,
            &self.key,
            &self.spec,
            &self.options,
            now,
            next_run_at,
        );
        self.next_run_at = next_run_at;
        self.next_job_id = job.id;
        Ok(job)
    }
}

fn occurrence(
    queue_name: &str,
    key: &str,
    spec: &RepeatableJobSpec,
    options: &JobOptions,
    now: DateTime<Utc>,
    run_at: DateTime<Utc>,
) -> Job {
    let mut job = Job::new(queue_name, spec.name.clone(), spec.payload.clone())
        .with_options(options)
        .created_at(now)
        .scheduled_for(run_at);
    job.repeat_key = Some(key.to_string());
    job
}

/// Operations every queue backend provides.
///
/// Implementations must be safe to share between workers, producers and the
/// dashboard through an `Arc<dyn JobQueue>`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// The backend's notion of "now". Eligibility and retention are judged
    /// against this clock.
    fn now(&self) -> DateTime<Utc>;

    /// Store a job. Jobs scheduled in the future start out delayed.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Promote due delayed jobs and recover stalled ones, then take the
    /// oldest waiting job and mark it active under a lock of
    /// [`lock_duration`](JobQueue::lock_duration). Returns `None` when nothing
    /// is eligible.
    async fn dequeue(&self, queue_name: &str) -> Result<Option<Job>>;

    fn lock_duration(&self) -> Duration {
        DEFAULT_LOCK_DURATION
    }

    /// Push the lock on an active job out to `now + lock_duration`. Returns
    /// `false` when the job is no longer active.
    async fn extend_lock(&self, job: &Job) -> Result<bool>;

    /// Put an active job back at the head of the waiting list without
    /// recording an attempt. Returns `false` when the job was not active.
    async fn release(&self, job: &Job) -> Result<bool>;

    /// Return active jobs whose lock has lapsed to the waiting list.
    async fn recover_stalled(&self, queue_name: &str) -> Result<Vec<JobId>>;

    /// Mark an active job completed and apply completed-job retention.
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Record a failed attempt. With `retry_at` the job becomes delayed until
    /// then, carrying `job.attempts`; without it the job is failed for good.
    async fn nack(&self, job: &Job, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Put an active job back as delayed until `eligible_at` without
    /// recording an attempt.
    async fn requeue(&self, job: &Job, eligible_at: DateTime<Utc>) -> Result<()>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs in one state, newest activity first for finished jobs and
    /// queue order otherwise.
    async fn jobs_by_status(
        &self,
        queue_name: &str,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>>;

    async fn counts(&self, queue_name: &str) -> Result<JobCounts>;

    async fn queue_names(&self) -> Result<Vec<String>>;

    /// Store a repeatable registration and its first occurrence.
    async fn add_repeatable(
        &self,
        queue_name: &str,
        spec: RepeatableJobSpec,
        options: &JobOptions,
    ) -> Result<RepeatableJob>;

    /// Remove every registration named `name` together with its pending
    /// occurrence. Returns whether anything was removed.
    async fn remove_repeatable(&self, queue_name: &str, name: &str) -> Result<bool>;

    async fn list_repeatable(&self, queue_name: &str) -> Result<Vec<RepeatableJob>>;

    async fn ping(&self) -> Result<()>;

    async fn stats(&self, queue_name: &str) -> Result<QueueStats> {
        let counts = self.counts(queue_name).await?;
        let repeatables = self.list_repeatable(queue_name).await?;
        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            counts,
            repeatable_jobs: repeatables.len(),
            next_repeat_at: repeatables.iter().map(|r| r.next_run_at).min(),
            captured_at: self.now(),
        })
    }
}

/// Minimal key-value interface with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Oldest finish time a retained job may have, if the policy limits age.
pub(crate) fn retention_cutoff(keep: &KeepJobs, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    keep.age
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn spec() -> RepeatableJobSpec {
        RepeatableJobSpec::new(
            "poll-feeds",
            json!({"kind": "tick", "source": "rss"}),
            CronSchedule::new("0 */15 * * * *").unwrap(),
        )
    }

    #[test]
    fn test_repeat_key_includes_schedule() {
        assert_eq!(spec().key(), "poll-feeds:0 */15 * * * *:UTC");
    }

    #[test]
    fn test_materialize_and_advance() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 0).unwrap();
        let (mut repeat, first) =
            RepeatableJob::materialize("rss", spec(), &JobOptions::default(), now).unwrap();

        assert_eq!(first.scheduled_at, Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap());
        assert_eq!(first.repeat_key.as_deref(), Some(repeat.key.as_str()));
        assert_eq!(repeat.next_job_id, first.id);

        // Activated right on time: the next occurrence is one period later.
        let second = repeat.advance(first.scheduled_at).unwrap();
        assert_eq!(second.scheduled_at, Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap());
        assert_eq!(repeat.next_job_id, second.id);
    }

    #[test]
    fn test_advance_after_downtime_skips_missed_ticks() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 0).unwrap();
        let (mut repeat, _) =
            RepeatableJob::materialize("rss", spec(), &JobOptions::default(), now).unwrap();

        let late = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();
        let next = repeat.advance(late).unwrap();
        assert_eq!(next.scheduled_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 15, 0).unwrap());
    }

    #[test]
    fn test_retention_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let keep = KeepJobs::new(Some(3600), Some(10));
        assert_eq!(
            retention_cutoff(&keep, now),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap())
        );
        assert_eq!(retention_cutoff(&KeepJobs::count(5), now), None);
    }
}
