//! In-process queue and key-value store.
//!
//! `MemoryQueue` implements [`JobQueue`] and [`KeyValueStore`] entirely in
//! memory. Nothing survives a restart, so it is meant for tests and local
//! runs. Time comes from a [`Clock`]; pair it with a
//! [`MockClock`](crate::clock::MockClock) to exercise delays, retention and
//! cache expiry without waiting.
//!
//! ```rust
//! use ferrywork::clock::MockClock;
//! use ferrywork::queue::{JobQueue, MemoryQueue};
//! use ferrywork::Job;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> ferrywork::Result<()> {
//! let clock = MockClock::new();
//! let queue = MemoryQueue::with_clock(clock.clone());
//!
//! let job = Job::new("relay", "later", json!({}))
//!     .created_at(queue.now())
//!     .with_delay(Duration::from_secs(60));
//! queue.enqueue(job).await?;
//! assert!(queue.dequeue("relay").await?.is_none());
//!
//! clock.advance(chrono::Duration::seconds(60));
//! assert!(queue.dequeue("relay").await?.is_some());
//! # Ok(())
//! # }
//! ```

use crate::{
    FerryworkError, Result,
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobOptions, JobStatus, KeepJobs, add_duration},
    queue::{
        DEFAULT_LOCK_DURATION, JobQueue, KeyValueStore, RepeatableJob, RepeatableJobSpec,
        retention_cutoff,
    },
    stats::JobCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<JobId>,
    /// Keyed by eligibility time, then insertion sequence for stable order.
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    /// Active job ids and the time their lock lapses.
    active: HashMap<JobId, DateTime<Utc>>,
    /// Oldest finish first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    repeatables: BTreeMap<String, RepeatableJob>,
}

impl QueueState {
    fn unlink(&mut self, job_id: JobId) {
        self.waiting.retain(|id| *id != job_id);
        self.delayed.retain(|_, id| *id != job_id);
        self.active.remove(&job_id);
        self.completed.retain(|id| *id != job_id);
        self.failed.retain(|id| *id != job_id);
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Storage {
    jobs: HashMap<JobId, Job>,
    queues: BTreeMap<String, QueueState>,
    cache: HashMap<String, CacheEntry>,
    sequence: u64,
}

impl Storage {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// File a job under its status, replacing any stored copy.
    fn place(&mut self, mut job: Job, now: DateTime<Utc>) {
        job.status = if job.scheduled_at > now {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        let seq = self.next_sequence();
        let state = self.queue(&job.queue_name);
        state.unlink(job.id);
        match job.status {
            JobStatus::Delayed => {
                state.delayed.insert((job.scheduled_at, seq), job.id);
            }
            _ => state.waiting.push_back(job.id),
        }
        self.jobs.insert(job.id, job);
    }

    fn promote_due(&mut self, queue_name: &str, now: DateTime<Utc>) {
        let Some(state) = self.queues.get_mut(queue_name) else {
            return;
        };
        let due: Vec<(DateTime<Utc>, u64)> = state
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(job_id) = state.delayed.remove(&key) {
                state.waiting.push_back(job_id);
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Waiting;
                }
            }
        }
    }

    /// Move an active job back to the head of the waiting list.
    fn release(&mut self, queue_name: &str, job_id: JobId) -> bool {
        let Some(state) = self.queues.get_mut(queue_name) else {
            return false;
        };
        if state.active.remove(&job_id).is_none() {
            return false;
        }
        state.waiting.push_front(job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.status = JobStatus::Waiting;
            job.started_at = None;
        }
        true
    }

    /// Release every active job whose lock lapsed at or before `now`, oldest
    /// claim first in the waiting list.
    fn recover_stalled(&mut self, queue_name: &str, now: DateTime<Utc>) -> Vec<JobId> {
        let Some(state) = self.queues.get(queue_name) else {
            return Vec::new();
        };
        let mut lapsed: Vec<(DateTime<Utc>, JobId)> = state
            .active
            .iter()
            .filter(|(_, locked_until)| **locked_until <= now)
            .map(|(id, locked_until)| (*locked_until, *id))
            .collect();
        lapsed.sort();

        let mut recovered = Vec::with_capacity(lapsed.len());
        for (_, job_id) in lapsed.into_iter().rev() {
            if self.release(queue_name, job_id) {
                recovered.push(job_id);
            }
        }
        recovered.reverse();
        recovered
    }

    fn active_job(&mut self, job: &Job) -> Result<&mut Job> {
        let stored = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| FerryworkError::JobNotFound {
                id: job.id.to_string(),
            })?;
        if stored.status != JobStatus::Active {
            return Err(FerryworkError::Queue {
                message: format!("job {} is {}, not active", job.id, stored.status),
            });
        }
        Ok(stored)
    }

    fn prune(&mut self, queue_name: &str, status: JobStatus, keep: KeepJobs, now: DateTime<Utc>) {
        let cutoff = retention_cutoff(&keep, now);
        let Some(state) = self.queues.get_mut(queue_name) else {
            return;
        };
        let list = match status {
            JobStatus::Completed => &mut state.completed,
            JobStatus::Failed => &mut state.failed,
            _ => return,
        };

        let mut removed = Vec::new();
        if let Some(cutoff) = cutoff {
            while let Some(id) = list.front().copied() {
                let expired = self
                    .jobs
                    .get(&id)
                    .and_then(|job| job.finished_at)
                    .is_none_or(|finished| finished < cutoff);
                if !expired {
                    break;
                }
                list.pop_front();
                removed.push(id);
            }
        }
        if let Some(count) = keep.count {
            while list.len() > count {
                if let Some(id) = list.pop_front() {
                    removed.push(id);
                }
            }
        }

        if !removed.is_empty() {
            debug!(
                "Pruned {} {} jobs from queue {}",
                removed.len(),
                status,
                queue_name
            );
        }
        for id in removed {
            self.jobs.remove(&id);
        }
    }
}

pub struct MemoryQueue {
    storage: RwLock<Storage>,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            storage: RwLock::new(Storage::default()),
            clock: Arc::new(clock),
            lock_duration: DEFAULT_LOCK_DURATION,
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        if storage.jobs.contains_key(&job.id) {
            return Err(FerryworkError::Queue {
                message: format!("job {} already exists", job.id),
            });
        }
        let job_id = job.id;
        storage.place(job, now);
        Ok(job_id)
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<Job>> {
        let now = self.now();
        let locked_until = add_duration(now, self.lock_duration);
        let mut storage = self.storage.write().await;
        storage.promote_due(queue_name, now);
        let recovered = storage.recover_stalled(queue_name, now);
        if !recovered.is_empty() {
            warn!("Recovered {} stalled jobs on queue {}", recovered.len(), queue_name);
        }

        let Some(job_id) = storage.queue(queue_name).waiting.pop_front() else {
            return Ok(None);
        };
        let Some(mut job) = storage.jobs.get(&job_id).cloned() else {
            return Err(FerryworkError::JobNotFound {
                id: job_id.to_string(),
            });
        };

        // The next occurrence is built before the claim so a schedule error
        // leaves this one waiting.
        let advanced = match &job.repeat_key {
            Some(key) => match storage.queue(queue_name).repeatables.get_mut(key) {
                Some(repeat) if repeat.next_job_id == job.id => Some(repeat.advance(now)),
                _ => None,
            },
            None => None,
        };
        let next = match advanced.transpose() {
            Ok(next) => next,
            Err(e) => {
                storage.queue(queue_name).waiting.push_front(job_id);
                return Err(e);
            }
        };

        job.status = JobStatus::Active;
        job.started_at = Some(now);
        storage.jobs.insert(job_id, job.clone());
        storage.queue(queue_name).active.insert(job_id, locked_until);

        if let Some(next) = next {
            debug!("Scheduled next {} occurrence at {}", job.name, next.scheduled_at);
            storage.place(next, now);
        }

        Ok(Some(job))
    }

    fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    async fn extend_lock(&self, job: &Job) -> Result<bool> {
        let locked_until = add_duration(self.now(), self.lock_duration);
        let mut storage = self.storage.write().await;
        match storage
            .queues
            .get_mut(&job.queue_name)
            .and_then(|state| state.active.get_mut(&job.id))
        {
            Some(lock) => {
                *lock = locked_until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, job: &Job) -> Result<bool> {
        let mut storage = self.storage.write().await;
        Ok(storage.release(&job.queue_name, job.id))
    }

    async fn recover_stalled(&self, queue_name: &str) -> Result<Vec<JobId>> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        Ok(storage.recover_stalled(queue_name, now))
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        let keep = {
            let stored = storage.active_job(job)?;
            stored.status = JobStatus::Completed;
            stored.attempts = job.attempts;
            stored.finished_at = Some(now);
            stored.error_message = None;
            stored.remove_on_complete
        };
        let state = storage.queue(&job.queue_name);
        state.active.remove(&job.id);
        state.completed.push_back(job.id);
        storage.prune(&job.queue_name, JobStatus::Completed, keep, now);
        Ok(())
    }

    async fn nack(&self, job: &Job, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        let seq = storage.next_sequence();
        let keep = {
            let stored = storage.active_job(job)?;
            stored.attempts = job.attempts;
            stored.error_message = Some(error.to_string());
            match retry_at {
                Some(at) => {
                    stored.status = JobStatus::Delayed;
                    stored.scheduled_at = at;
                    stored.started_at = None;
                }
                None => {
                    stored.status = JobStatus::Failed;
                    stored.finished_at = Some(now);
                }
            }
            stored.remove_on_fail
        };

        let state = storage.queue(&job.queue_name);
        state.active.remove(&job.id);
        match retry_at {
            Some(at) => {
                state.delayed.insert((at, seq), job.id);
            }
            None => {
                state.failed.push_back(job.id);
                storage.prune(&job.queue_name, JobStatus::Failed, keep, now);
            }
        }
        Ok(())
    }

    async fn requeue(&self, job: &Job, eligible_at: DateTime<Utc>) -> Result<()> {
        let mut storage = self.storage.write().await;
        let seq = storage.next_sequence();
        {
            let stored = storage.active_job(job)?;
            stored.status = JobStatus::Delayed;
            stored.scheduled_at = eligible_at;
            stored.started_at = None;
        }
        let state = storage.queue(&job.queue_name);
        state.active.remove(&job.id);
        state.delayed.insert((eligible_at, seq), job.id);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(&job_id).cloned())
    }

    async fn jobs_by_status(
        &self,
        queue_name: &str,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let storage = self.storage.read().await;
        let Some(state) = storage.queues.get(queue_name) else {
            return Ok(Vec::new());
        };
        let ids: Vec<JobId> = match status {
            JobStatus::Waiting => state.waiting.iter().copied().collect(),
            JobStatus::Delayed => state.delayed.values().copied().collect(),
            JobStatus::Active => {
                let mut ids: Vec<JobId> = state.active.keys().copied().collect();
                ids.sort_by_key(|id| storage.jobs.get(id).and_then(|j| j.started_at));
                ids
            }
            JobStatus::Completed => state.completed.iter().rev().copied().collect(),
            JobStatus::Failed => state.failed.iter().rev().copied().collect(),
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| storage.jobs.get(&id).cloned())
            .take(limit)
            .collect())
    }

    async fn counts(&self, queue_name: &str) -> Result<JobCounts> {
        let storage = self.storage.read().await;
        let Some(state) = storage.queues.get(queue_name) else {
            return Ok(JobCounts::default());
        };
        Ok(JobCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let storage = self.storage.read().await;
        Ok(storage.queues.keys().cloned().collect())
    }

    async fn add_repeatable(
        &self,
        queue_name: &str,
        spec: RepeatableJobSpec,
        options: &JobOptions,
    ) -> Result<RepeatableJob> {
        let now = self.now();
        let (repeat, first) = RepeatableJob::materialize(queue_name, spec, options, now)?;
        let mut storage = self.storage.write().await;

        if let Some(previous) = storage.queue(queue_name).repeatables.remove(&repeat.key) {
            storage.queue(queue_name).unlink(previous.next_job_id);
            storage.jobs.remove(&previous.next_job_id);
        }
        storage.place(first, now);
        storage
            .queue(queue_name)
            .repeatables
            .insert(repeat.key.clone(), repeat.clone());
        Ok(repeat)
    }

    async fn remove_repeatable(&self, queue_name: &str, name: &str) -> Result<bool> {
        let mut storage = self.storage.write().await;
        let state = storage.queue(queue_name);
        let keys: Vec<String> = state
            .repeatables
            .values()
            .filter(|r| r.spec.name == name)
            .map(|r| r.key.clone())
            .collect();

        let mut pending = Vec::new();
        for key in &keys {
            if let Some(repeat) = state.repeatables.remove(key) {
                pending.push(repeat.next_job_id);
            }
        }
        for job_id in pending {
            let still_pending = storage
                .jobs
                .get(&job_id)
                .is_some_and(|job| matches!(job.status, JobStatus::Delayed | JobStatus::Waiting));
            if still_pending {
                storage.queue(queue_name).unlink(job_id);
                storage.jobs.remove(&job_id);
            }
        }
        Ok(!keys.is_empty())
    }

    async fn list_repeatable(&self, queue_name: &str) -> Result<Vec<RepeatableJob>> {
        let storage = self.storage.read().await;
        Ok(storage
            .queues
            .get(queue_name)
            .map(|state| state.repeatables.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryQueue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        let expired = match storage.cache.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            storage.cache.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = add_duration(self.now(), ttl);
        let mut storage = self.storage.write().await;
        storage.cache.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut storage = self.storage.write().await;
        Ok(storage.cache.remove(key).is_some())
    }
}
