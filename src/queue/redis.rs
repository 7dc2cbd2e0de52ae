//! Redis-backed queue and key-value store.
//!
//! Key layout, with `p` the configured prefix and `q` the queue name:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `p:queues` | set | known queue names |
//! | `p:job:<id>` | string | job JSON |
//! | `p:q:wait` | list | waiting job ids, FIFO |
//! | `p:q:delayed` | zset | delayed job ids scored by eligibility (ms) |
//! | `p:q:active` | zset | active job ids scored by lock deadline (ms) |
//! | `p:q:completed` | zset | completed job ids scored by finish time (ms) |
//! | `p:q:failed` | zset | failed job ids scored by finish time (ms) |
//! | `p:q:repeat` | hash | repeat key -> registration JSON |
//!
//! A job moves from `wait` to `active` in one script, so a crashed worker
//! never leaves an id in neither. Active ids whose lock deadline passes are
//! pushed back onto `wait` by the next `dequeue`.
//!
//! Cache keys used through [`KeyValueStore`] are stored verbatim so other
//! tools can read them.

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
use redis::aio::ConnectionManager;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

/// KEYS: wait, active. ARGV: lock deadline (ms).
const CLAIM_SCRIPT: &str = r"
local id = redis.call('LPOP', KEYS[1])
if id then
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
";

/// KEYS: active. ARGV: lock deadline (ms), job id.
const EXTEND_SCRIPT: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
  return 1
end
return 0
";

/// KEYS: active, wait. ARGV: job id.
const RELEASE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
";

pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
}

impl RedisQueue {
    pub const DEFAULT_PREFIX: &'static str = "ferrywork";

    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_prefix(url, Self::DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", redact(url));
        let client = redis::Client::open(url)
            .map_err(|e| FerryworkError::Config(format!("invalid store url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| FerryworkError::Connection {
                message: e.to_string(),
            })?;

        let queue = Self {
            conn,
            prefix: prefix.to_string(),
            clock: Arc::new(SystemClock),
            lock_duration: DEFAULT_LOCK_DURATION,
        };
        queue.ping().await?;
        Ok(queue)
    }

    /// Replace the clock used for eligibility and retention decisions.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// How long a dequeued job stays claimed without a lock extension.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    fn lock_deadline_ms(&self) -> i64 {
        add_duration(self.now(), self.lock_duration).timestamp_millis()
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn key(&self, queue_name: &str, kind: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue_name, kind)
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(FerryworkError::from))
            .transpose()
    }

    async fn load_jobs(&self, ids: Vec<String>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = JobId::parse_str(&id)?;
            if let Some(job) = self.load_job(job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn load_active(&self, job: &Job) -> Result<Job> {
        let stored = self
            .load_job(job.id)
            .await?
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

    /// Write a job and file it as waiting or delayed depending on `now`.
    async fn place(&self, mut job: Job, now: DateTime<Utc>) -> Result<()> {
        job.status = if job.scheduled_at > now {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        let encoded = serde_json::to_string(&job)?;
        let id = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(self.queues_key())
            .arg(&job.queue_name)
            .ignore()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(encoded)
            .ignore();
        if job.status == JobStatus::Delayed {
            pipe.cmd("ZADD")
                .arg(self.key(&job.queue_name, "delayed"))
                .arg(job.scheduled_at.timestamp_millis())
                .arg(&id)
                .ignore();
        } else {
            pipe.cmd("RPUSH")
                .arg(self.key(&job.queue_name, "wait"))
                .arg(&id)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Drop a job that has not started yet.
    async fn discard_pending(&self, queue_name: &str, job_id: JobId) -> Result<()> {
        let id = job_id.to_string();
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key(queue_name, "delayed"))
            .arg(&id)
            .ignore()
            .cmd("LREM")
            .arg(self.key(queue_name, "wait"))
            .arg(0)
            .arg(&id)
            .ignore()
            .cmd("DEL")
            .arg(self.job_key(job_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move one active id back to the head of `wait` and mark its job waiting.
    async fn release_id(&self, queue_name: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(queue_name, "active"))
            .key(self.key(queue_name, "wait"))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            return Ok(false);
        }

        let job_id = JobId::parse_str(id)?;
        if let Some(mut job) = self.load_job(job_id).await? {
            job.status = JobStatus::Waiting;
            job.started_at = None;
            let _: () = redis::cmd("SET")
                .arg(self.job_key(job_id))
                .arg(serde_json::to_string(&job)?)
                .query_async(&mut conn)
                .await?;
        }
        Ok(true)
    }

    async fn promote_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let delayed_key = self.key(queue_name, "delayed");
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query_async(&mut conn)
            .await?;

        for id in due {
            // Whoever removes the entry owns the promotion.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }
            let job_id = JobId::parse_str(&id)?;
            if let Some(mut job) = self.load_job(job_id).await? {
                job.status = JobStatus::Waiting;
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(self.job_key(job_id))
                    .arg(serde_json::to_string(&job)?)
                    .ignore()
                    .cmd("RPUSH")
                    .arg(self.key(queue_name, "wait"))
                    .arg(&id)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Move a finished job into its terminal set and apply retention.
    async fn finish(&self, job: &Job, status: JobStatus, keep: KeepJobs) -> Result<()> {
        let set = match status {
            JobStatus::Completed => "completed",
            _ => "failed",
        };
        let finished_at = job.finished_at.unwrap_or_else(|| self.now());
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(serde_json::to_string(job)?)
            .ignore()
            .cmd("ZREM")
            .arg(self.key(&job.queue_name, "active"))
            .arg(job.id.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(self.key(&job.queue_name, set))
            .arg(finished_at.timestamp_millis())
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

        self.prune(&job.queue_name, set, keep).await
    }

    async fn prune(&self, queue_name: &str, set: &str, keep: KeepJobs) -> Result<()> {
        let key = self.key(queue_name, set);
        let mut conn = self.conn.clone();
        let mut doomed: Vec<String> = Vec::new();

        if let Some(cutoff) = retention_cutoff(&keep, self.now()) {
            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(format!("({}", cutoff.timestamp_millis()))
                .query_async(&mut conn)
                .await?;
            doomed.extend(expired);
        }
        if let Some(count) = keep.count {
            let len: usize = redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;
            let excess = len.saturating_sub(count);
            if excess > 0 {
                let oldest: Vec<String> = redis::cmd("ZRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(excess - 1)
                    .query_async(&mut conn)
                    .await?;
                doomed.extend(oldest);
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }
        doomed.sort();
        doomed.dedup();

        let mut pipe = redis::pipe();
        for id in &doomed {
            pipe.cmd("ZREM").arg(&key).arg(id).ignore();
            pipe.cmd("DEL").arg(format!("{}:job:{}", self.prefix, id)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        debug!("Pruned {} {} jobs from queue {}", doomed.len(), set, queue_name);
        Ok(())
    }

    async fn load_repeatable(&self, queue_name: &str, key: &str) -> Result<Option<RepeatableJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(queue_name, "repeat"))
            .arg(key)
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(FerryworkError::from))
            .transpose()
    }

    async fn save_repeatable(&self, repeat: &RepeatableJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.key(&repeat.queue_name, "repeat"))
            .arg(&repeat.key)
            .arg(serde_json::to_string(repeat)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(skip(self, job), fields(queue = %job.queue_name, job_id = %job.id))]
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.job_key(job.id))
            .query_async(&mut conn)
            .await?;
        if exists {
            return Err(FerryworkError::Queue {
                message: format!("job {} already exists", job.id),
            });
        }
        let job_id = job.id;
        self.place(job, self.now()).await?;
        Ok(job_id)
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<Job>> {
        let now = self.now();
        self.promote_due(queue_name, now).await?;
        let recovered = self.recover_stalled(queue_name).await?;
        if !recovered.is_empty() {
            warn!("Recovered {} stalled jobs on queue {}", recovered.len(), queue_name);
        }

        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.key(queue_name, "wait"))
            .key(self.key(queue_name, "active"))
            .arg(self.lock_deadline_ms())
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = claimed else {
            return Ok(None);
        };
        let job_id = JobId::parse_str(&id)?;
        let Some(mut job) = self.load_job(job_id).await? else {
            warn!("Dropping dangling job id {} from queue {}", id, queue_name);
            let _: () = redis::cmd("ZREM")
                .arg(self.key(queue_name, "active"))
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            return Ok(None);
        };

        // The next occurrence is built before the job is marked active so a
        // schedule error hands the claim back.
        let mut advanced = None;
        if let Some(key) = &job.repeat_key {
            if let Some(mut repeat) = self.load_repeatable(queue_name, key).await? {
                if repeat.next_job_id == job.id {
                    match repeat.advance(now) {
                        Ok(next) => advanced = Some((repeat, next)),
                        Err(e) => {
                            self.release_id(queue_name, &id).await?;
                            return Err(e);
                        }
                    }
                }
            }
        }

        job.status = JobStatus::Active;
        job.started_at = Some(now);
        let _: () = redis::cmd("SET")
            .arg(self.job_key(job_id))
            .arg(serde_json::to_string(&job)?)
            .query_async(&mut conn)
            .await?;

        if let Some((repeat, next)) = advanced {
            debug!("Scheduled next {} occurrence at {}", job.name, next.scheduled_at);
            self.place(next, now).await?;
            self.save_repeatable(&repeat).await?;
        }

        Ok(Some(job))
    }

    fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    async fn extend_lock(&self, job: &Job) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(self.key(&job.queue_name, "active"))
            .arg(self.lock_deadline_ms())
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, job: &Job) -> Result<bool> {
        self.release_id(&job.queue_name, &job.id.to_string()).await
    }

    async fn recover_stalled(&self, queue_name: &str) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let lapsed: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(queue_name, "active"))
            .arg("-inf")
            .arg(self.now().timestamp_millis())
            .query_async(&mut conn)
            .await?;

        let mut recovered = Vec::with_capacity(lapsed.len());
        // Newest first so the oldest claim ends up at the head of `wait`.
        for id in lapsed.iter().rev() {
            if self.release_id(queue_name, id).await? {
                recovered.push(JobId::parse_str(id)?);
            }
        }
        recovered.reverse();
        Ok(recovered)
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut stored = self.load_active(job).await?;
        stored.status = JobStatus::Completed;
        stored.attempts = job.attempts;
        stored.finished_at = Some(self.now());
        stored.error_message = None;
        let keep = stored.remove_on_complete;
        self.finish(&stored, JobStatus::Completed, keep).await
    }

    async fn nack(&self, job: &Job, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut stored = self.load_active(job).await?;
        stored.attempts = job.attempts;
        stored.error_message = Some(error.to_string());

        match retry_at {
            Some(at) => {
                stored.status = JobStatus::Delayed;
                stored.scheduled_at = at;
                stored.started_at = None;
                let mut conn = self.conn.clone();
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(self.job_key(job.id))
                    .arg(serde_json::to_string(&stored)?)
                    .ignore()
                    .cmd("ZREM")
                    .arg(self.key(&job.queue_name, "active"))
                    .arg(job.id.to_string())
                    .ignore()
                    .cmd("ZADD")
                    .arg(self.key(&job.queue_name, "delayed"))
                    .arg(at.timestamp_millis())
                    .arg(job.id.to_string())
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            None => {
                stored.status = JobStatus::Failed;
                stored.finished_at = Some(self.now());
                let keep = stored.remove_on_fail;
                self.finish(&stored, JobStatus::Failed, keep).await
            }
        }
    }

    async fn requeue(&self, job: &Job, eligible_at: DateTime<Utc>) -> Result<()> {
        let mut stored = self.load_active(job).await?;
        stored.status = JobStatus::Delayed;
        stored.scheduled_at = eligible_at;
        stored.started_at = None;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(serde_json::to_string(&stored)?)
            .ignore()
            .cmd("ZREM")
            .arg(self.key(&job.queue_name, "active"))
            .arg(job.id.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(self.key(&job.queue_name, "delayed"))
            .arg(eligible_at.timestamp_millis())
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.load_job(job_id).await
    }

    async fn jobs_by_status(
        &self,
        queue_name: &str,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let last = limit as i64 - 1;
        let ids: Vec<String> = match status {
            JobStatus::Waiting => {
                redis::cmd("LRANGE")
                    .arg(self.key(queue_name, "wait"))
                    .arg(0)
                    .arg(last)
                    .query_async(&mut conn)
                    .await?
            }
            JobStatus::Delayed => {
                redis::cmd("ZRANGE")
                    .arg(self.key(queue_name, "delayed"))
                    .arg(0)
                    .arg(last)
                    .query_async(&mut conn)
                    .await?
            }
            JobStatus::Active => {
                redis::cmd("ZRANGE")
                    .arg(self.key(queue_name, "active"))
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
            JobStatus::Completed | JobStatus::Failed => {
                redis::cmd("ZREVRANGE")
                    .arg(self.key(queue_name, status.as_str()))
                    .arg(0)
                    .arg(last)
                    .query_async(&mut conn)
                    .await?
            }
        };

        let mut jobs = self.load_jobs(ids).await?;
        if status == JobStatus::Active {
            jobs.sort_by_key(|job| job.started_at);
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn counts(&self, queue_name: &str) -> Result<JobCounts> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.key(queue_name, "wait"))
                .cmd("ZCARD")
                .arg(self.key(queue_name, "active"))
                .cmd("ZCARD")
                .arg(self.key(queue_name, "delayed"))
                .cmd("ZCARD")
                .arg(self.key(queue_name, "completed"))
                .cmd("ZCARD")
                .arg(self.key(queue_name, "failed"))
                .query_async(&mut conn)
                .await?;
        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.queues_key())
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn add_repeatable(
        &self,
        queue_name: &str,
        spec: RepeatableJobSpec,
        options: &JobOptions,
    ) -> Result<RepeatableJob> {
        let now = self.now();
        let (repeat, first) = RepeatableJob::materialize(queue_name, spec, options, now)?;

        if let Some(previous) = self.load_repeatable(queue_name, &repeat.key).await? {
            self.discard_pending(queue_name, previous.next_job_id).await?;
        }
        self.place(first, now).await?;
        self.save_repeatable(&repeat).await?;
        Ok(repeat)
    }

    async fn remove_repeatable(&self, queue_name: &str, name: &str) -> Result<bool> {
        let mut removed = false;
        for repeat in self.list_repeatable(queue_name).await? {
            if repeat.spec.name != name {
                continue;
            }
            let mut conn = self.conn.clone();
            let deleted: i64 = redis::cmd("HDEL")
                .arg(self.key(queue_name, "repeat"))
                .arg(&repeat.key)
                .query_async(&mut conn)
                .await?;
            removed |= deleted > 0;

            let pending = self
                .load_job(repeat.next_job_id)
                .await?
                .is_some_and(|job| matches!(job.status, JobStatus::Delayed | JobStatus::Waiting));
            if pending {
                self.discard_pending(queue_name, repeat.next_job_id).await?;
            }
        }
        Ok(removed)
    }

    async fn list_repeatable(&self, queue_name: &str) -> Result<Vec<RepeatableJob>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(queue_name, "repeat"))
            .query_async(&mut conn)
            .await?;
        let mut repeats = raw
            .values()
            .map(|value| serde_json::from_str::<RepeatableJob>(value).map_err(FerryworkError::from))
            .collect::<Result<Vec<_>>>()?;
        repeats.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(repeats)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisQueue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }
}

/// Hide credentials in a connection URL before logging it.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_password() {
        assert_eq!(
            redact("redis://:hunter2@localhost:6379/1"),
            "redis://:***@localhost:6379/1"
        );
        assert_eq!(redact("redis://localhost:6379"), "redis://localhost:6379");
        assert_eq!(redact("not a url"), "<invalid url>");
    }
}
