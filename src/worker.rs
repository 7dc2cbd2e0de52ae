//! Queue workers.
//!
//! A [`Worker`] pulls jobs from one queue and runs them through a
//! [`JobHandler`] with bounded concurrency. Handler results drive the job
//! lifecycle:
//!
//! - `Ok(_)` acks the job.
//! - [`HandlerError::Failed`] consumes an attempt. While attempts remain the
//!   job is delayed by its [`BackoffPolicy`](crate::retry::BackoffPolicy);
//!   afterwards it is failed for good.
//! - [`HandlerError::RateLimited`] puts the job back without consuming an
//!   attempt and pauses the whole worker until the downstream API's
//!   `retry_after` has passed.
//!
//! While a handler runs the worker keeps extending the job's lock, so a job
//! only goes back to waiting when its worker died or was aborted. Jobs the
//! worker aborts at shutdown are released straight away.

use crate::{
    FerryworkError, Result,
    error::HandlerError,
    events::{EventBus, WorkerEvent},
    job::{Job, JobId, JobOptions, add_duration},
    queue::{JobQueue, RepeatableJob, RepeatableJobSpec},
    rate_limit::{PauseWindow, RateLimit, RateLimiter},
    shutdown::ShutdownTracker,
    stats::JobCounts,
};
use futures_util::FutureExt;
use std::{
    collections::HashMap, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Semaphore, broadcast},
    task::{self, JoinError, JoinSet},
    time::{Instant, interval_at, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a handler reports on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    /// Short description of the result, e.g. the id of a sent message.
    pub note: Option<String>,
}

impl JobOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
        }
    }
}

pub type HandlerResult = std::result::Result<JobOutcome, HandlerError>;

pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Result of a single [`Worker::run_once`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The worker is inside a rate-limit pause for this much longer.
    Paused(Duration),
    /// Nothing was eligible.
    Idle,
    Processed(JobId),
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    handler: JobHandler,
    concurrency: usize,
    poll_interval: Duration,
    job_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    limiter: Option<RateLimiter>,
    job_options: JobOptions,
    pause: Arc<PauseWindow>,
    events: EventBus,
    log_counts: bool,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, queue_name: impl Into<String>, handler: JobHandler) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            concurrency: 3,
            poll_interval: Duration::from_secs(1),
            job_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            limiter: None,
            job_options: JobOptions::default(),
            pause: Arc::new(PauseWindow::new()),
            events: EventBus::default(),
            log_counts: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Start at most `rate_limit.max` jobs per `rate_limit.per`.
    pub fn with_limiter(mut self, rate_limit: RateLimit) -> Self {
        self.limiter = Some(RateLimiter::new(rate_limit));
        self
    }

    /// Options stamped on jobs created through [`Worker::add_job`] and on
    /// repeatable registrations.
    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.job_options = options;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Query and report queue counts after every completed or failed job.
    pub fn with_count_logging(mut self, enabled: bool) -> Self {
        self.log_counts = enabled;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn job_options(&self) -> &JobOptions {
        &self.job_options
    }

    pub fn pause_window(&self) -> &PauseWindow {
        &self.pause
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Enqueue a job on this worker's queue with the worker's job options.
    pub async fn add_job(&self, name: &str, payload: serde_json::Value) -> Result<JobId> {
        let job = Job::new(self.queue_name.clone(), name, payload)
            .with_options(&self.job_options)
            .created_at(self.queue.now());
        self.queue.enqueue(job).await
    }

    /// Register a repeatable job, replacing any registration with the same
    /// name. Safe to call on every startup.
    pub async fn register_repeatable(&self, spec: RepeatableJobSpec) -> Result<RepeatableJob> {
        if self.queue.remove_repeatable(&self.queue_name, &spec.name).await? {
            debug!("Replaced repeatable {} on {}", spec.name, self.queue_name);
        }
        self.queue
            .add_repeatable(&self.queue_name, spec, &self.job_options)
            .await
    }

    /// Process jobs until `shutdown` is cancelled, then wait for in-flight
    /// jobs (bounded by the shutdown timeout) and return.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Worker started for queue {} (concurrency {})",
            self.queue_name, self.concurrency
        );
        self.events.publish(WorkerEvent::Ready {
            queue: self.queue_name.clone(),
        });

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut claimed: HashMap<task::Id, Job> = HashMap::new();

        loop {
            while let Some(finished) = in_flight.try_join_next_with_id() {
                self.reap(&mut claimed, finished).await;
            }

            if let Some(remaining) = self.pause.remaining(self.queue.now()) {
                let wait = remaining.min(self.poll_interval);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(wait) => continue,
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit.map_err(|e| FerryworkError::Worker {
                    message: format!("concurrency limiter closed: {}", e),
                })?,
            };

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = limiter.acquire() => {}
                }
            }

            // A job that finished while we waited may have started a pause.
            if self.pause.remaining(self.queue.now()).is_some() {
                drop(permit);
                continue;
            }

            match self.queue.dequeue(&self.queue_name).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    let owned = job.clone();
                    let handle = in_flight.spawn(async move {
                        worker.process_job(owned).await;
                        drop(permit);
                    });
                    claimed.insert(handle.id(), job);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    self.report_error(&e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(
                "Worker for {} waiting on {} in-flight jobs",
                self.queue_name,
                in_flight.len()
            );
        }
        let drained = timeout(self.shutdown_timeout, async {
            while let Some(finished) = in_flight.join_next_with_id().await {
                self.reap(&mut claimed, finished).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Worker for {} gave up on {} jobs after {:?}",
                self.queue_name,
                in_flight.len(),
                self.shutdown_timeout
            );
            in_flight.abort_all();
            while let Some(finished) = in_flight.join_next_with_id().await {
                self.reap(&mut claimed, finished).await;
            }
        }

        info!("Worker stopped for queue {}", self.queue_name);
        self.events.publish(WorkerEvent::Closed {
            queue: self.queue_name.clone(),
        });
        Ok(())
    }

    /// Take at most one job and process it inline.
    ///
    /// Honors the pause window but not the proactive limiter, so tests and
    /// tools can step a worker deterministically.
    pub async fn run_once(&self) -> Result<Step> {
        if let Some(remaining) = self.pause.remaining(self.queue.now()) {
            return Ok(Step::Paused(remaining));
        }
        match self.queue.dequeue(&self.queue_name).await? {
            Some(job) => {
                let job_id = job.id;
                self.process_job(job).await;
                Ok(Step::Processed(job_id))
            }
            None => Ok(Step::Idle),
        }
    }

    /// Forget a finished job task. A task that was aborted or panicked
    /// leaves its job claimed, so the claim is handed back.
    async fn reap(
        &self,
        claimed: &mut HashMap<task::Id, Job>,
        finished: std::result::Result<(task::Id, ()), JoinError>,
    ) {
        let e = match finished {
            Ok((id, ())) => {
                claimed.remove(&id);
                return;
            }
            Err(e) => e,
        };
        if e.is_panic() {
            error!("Job task for {} ended abnormally: {}", self.queue_name, e);
        }
        let Some(job) = claimed.remove(&e.id()) else {
            return;
        };
        match self.queue.release(&job).await {
            Ok(true) => info!("Released job {} back to {}", job.id, self.queue_name),
            Ok(false) => {}
            Err(err) => self.report_error(&err),
        }
    }

    async fn process_job(&self, mut job: Job) {
        let started = Instant::now();
        debug!("Processing job {} ({}) on {}", job.id, job.name, self.queue_name);
        self.events.publish(WorkerEvent::Active {
            queue: self.queue_name.clone(),
            job_id: job.id,
            name: job.name.clone(),
            attempt: job.attempts + 1,
        });

        let result = self.invoke_locked(&job).await;

        match result {
            Ok(outcome) => {
                if let Err(e) = self.queue.ack(&job).await {
                    self.report_error(&e);
                    return;
                }
                if let Some(note) = &outcome.note {
                    debug!("Job {} result: {}", job.id, note);
                }
                let counts = self.counts_snapshot().await;
                self.events.publish(WorkerEvent::Completed {
                    queue: self.queue_name.clone(),
                    job_id: job.id,
                    name: job.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    counts,
                });
            }
            Err(HandlerError::RateLimited { retry_after }) => {
                let eligible_at = add_duration(self.queue.now(), retry_after);
                let paused_until = self.pause.extend(eligible_at);
                if let Err(e) = self.queue.requeue(&job, eligible_at).await {
                    self.report_error(&e);
                    return;
                }
                self.events.publish(WorkerEvent::RateLimited {
                    queue: self.queue_name.clone(),
                    job_id: job.id,
                    retry_after,
                    paused_until,
                });
            }
            Err(HandlerError::Failed { message }) => {
                job.attempts += 1;
                if job.has_attempts_left() {
                    let delay = job.backoff.delay_for(job.attempts);
                    let retry_at = add_duration(self.queue.now(), delay);
                    if let Err(e) = self.queue.nack(&job, &message, Some(retry_at)).await {
                        self.report_error(&e);
                        return;
                    }
                    self.events.publish(WorkerEvent::Retrying {
                        queue: self.queue_name.clone(),
                        job_id: job.id,
                        attempts: job.attempts,
                        retry_at,
                        error: message,
                    });
                } else {
                    if let Err(e) = self.queue.nack(&job, &message, None).await {
                        self.report_error(&e);
                        return;
                    }
                    let counts = self.counts_snapshot().await;
                    self.events.publish(WorkerEvent::Failed {
                        queue: self.queue_name.clone(),
                        job_id: job.id,
                        attempts: job.attempts,
                        error: message,
                        counts,
                    });
                }
            }
        }
    }

    /// Run the handler while extending the job's lock every half lock period.
    async fn invoke_locked(&self, job: &Job) -> HandlerResult {
        let every = (self.queue.lock_duration() / 2).max(Duration::from_millis(10));
        let mut heartbeat = interval_at(Instant::now() + every, every);
        let call = self.invoke(job);
        tokio::pin!(call);
        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = heartbeat.tick() => match self.queue.extend_lock(job).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Job {} is no longer locked by this worker", job.id),
                    Err(e) => self.report_error(&e),
                },
            }
        }
    }

    /// Run the handler, turning a timeout or a panic into a failed attempt.
    async fn invoke(&self, job: &Job) -> HandlerResult {
        let call = AssertUnwindSafe((self.handler)(job.clone())).catch_unwind();
        let outcome = match self.job_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Job {} timed out after {:?}", job.id, limit);
                    return Err(HandlerError::failed(format!("timed out after {:?}", limit)));
                }
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error!("Job {} handler panicked: {}", job.id, message);
            Err(HandlerError::failed(format!("panic: {}", message)))
        })
    }

    async fn counts_snapshot(&self) -> Option<JobCounts> {
        if !self.log_counts {
            return None;
        }
        match self.queue.counts(&self.queue_name).await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!("Could not read counts for {}: {}", self.queue_name, e);
                None
            }
        }
    }

    fn report_error(&self, err: &FerryworkError) {
        if err.is_connection() {
            warn!("Store unreachable from worker {}: {}", self.queue_name, err);
        } else {
            error!("Worker {} error: {}", self.queue_name, err);
        }
        self.events.publish(WorkerEvent::Error {
            queue: self.queue_name.clone(),
            message: err.to_string(),
        });
    }
}

/// Runs several workers under one shutdown tracker.
pub struct WorkerPool {
    workers: Vec<Worker>,
    tracker: ShutdownTracker,
}

impl WorkerPool {
    pub fn new(tracker: ShutdownTracker) -> Self {
        Self {
            workers: Vec::new(),
            tracker,
        }
    }

    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run every worker until the tracker's token is cancelled. Each
    /// worker confirms its stop obligation once it has drained.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting worker pool with {} workers", self.workers.len());

        let mut handles = JoinSet::new();
        for worker in self.workers.drain(..) {
            let obligation = self.tracker.register(format!("worker:{}", worker.queue_name()));
            let token = self.tracker.token();
            handles.spawn(async move {
                let result = worker.run(token).await;
                obligation.confirm();
                result
            });
        }

        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Worker error: {}", e),
                Err(e) => {
                    return Err(FerryworkError::Worker {
                        message: format!("Worker task failed: {}", e),
                    });
                }
            }
        }
        Ok(())
    }
}
