//! # Ferrywork
//!
//! A durable job runtime for forwarding feed and mailbox items to chat
//! platforms, with content-addressed deduplication, cron ticks and adaptive
//! rate-limit backoff.
//!
//! ## Features
//!
//! - **Durable queues**: Redis backend (default) or an in-process store for
//!   tests and local runs
//! - **Retry with backoff**: fixed or exponential delays, bounded attempts
//! - **Rate-limit cooperation**: a handler that reports "retry after N" pauses
//!   the whole worker without consuming an attempt
//! - **Deduplication**: SHA-256 fingerprints of canonical item identities,
//!   remembered for a TTL
//! - **Cron scheduling**: six-field expressions with timezones, idempotent
//!   registration
//! - **Lifecycle events**: a broadcast channel of [`WorkerEvent`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrywork::{Job, Worker, HandlerError, worker::{JobHandler, JobOutcome}};
//! use ferrywork::queue::MemoryQueue;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ferrywork::Result<()> {
//!     let queue = Arc::new(MemoryQueue::new());
//!
//!     let handler: JobHandler = Arc::new(|job: Job| {
//!         Box::pin(async move {
//!             if job.payload["text"].is_null() {
//!                 return Err(HandlerError::failed("nothing to send"));
//!             }
//!             Ok(JobOutcome::done())
//!         })
//!     });
//!
//!     let worker = Worker::new(queue.clone(), "outbox", handler).with_concurrency(3);
//!     worker.add_job("send", json!({"text": "hello"})).await?;
//!
//!     let shutdown = CancellationToken::new();
//!     worker.run(shutdown).await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] belongs to one queue and moves through `waiting -> active ->
//! completed | delayed | failed`. Delayed jobs return to `waiting` once their
//! eligibility time passes. Finished jobs are kept according to the queue's
//! retention options.
//!
//! ### Workers
//!
//! A [`Worker`] polls one queue and runs a [`JobHandler`] with bounded
//! concurrency. Handlers return [`HandlerError::Failed`] to retry with
//! backoff, or [`HandlerError::RateLimited`] to pause the worker.
//!
//! ### Relay
//!
//! [`relay::Relay`] wires RSS and email [`ingest`] sources through the
//! [`dedup`] gate to a [`delivery`] sink, one queue per source.
//!
//! ## Feature Flags
//!
//! - `redis` - Enable the Redis queue backend (default)

pub mod clock;
pub mod config;
pub mod cron;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod events;
pub mod ingest;
pub mod job;
pub mod payload;
pub mod queue;
pub mod rate_limit;
pub mod relay;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::FerryworkConfig;
pub use cron::{CronError, CronSchedule};
pub use dedup::{Admission, DedupCache, IngestGate, fingerprint};
pub use error::{FerryworkError, HandlerError};
pub use events::{EventBus, WorkerEvent};
pub use job::{Job, JobId, JobOptions, JobStatus, KeepJobs};
pub use payload::{DeliveryItem, JobPayload};
pub use queue::{JobQueue, KeyValueStore, MemoryQueue, RepeatableJob, RepeatableJobSpec};
pub use rate_limit::{PauseWindow, RateLimit, RateLimiter};
pub use retry::BackoffPolicy;
pub use scheduler::Scheduler;
pub use shutdown::ShutdownTracker;
pub use stats::{JobCounts, QueueStats};
pub use worker::{JobHandler, JobOutcome, Worker, WorkerPool};

#[cfg(feature = "redis")]
pub use queue::RedisQueue;

/// Convenient type alias for Results with [`FerryworkError`] as the error type.
pub type Result<T> = std::result::Result<T, FerryworkError>;
