//! Worker lifecycle events.
//!
//! A [`Worker`](crate::worker::Worker) publishes a [`WorkerEvent`] at every
//! job transition on a tokio broadcast channel. Subscribers that fall behind
//! lose the oldest events rather than slowing the worker down.

use crate::job::JobId;
use crate::stats::JobCounts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready {
        queue: String,
    },
    Active {
        queue: String,
        job_id: JobId,
        name: String,
        attempt: u32,
    },
    Completed {
        queue: String,
        job_id: JobId,
        name: String,
        duration_ms: u64,
        counts: Option<JobCounts>,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    RateLimited {
        queue: String,
        job_id: JobId,
        retry_after: Duration,
        paused_until: DateTime<Utc>,
    },
    Failed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        error: String,
        counts: Option<JobCounts>,
    },
    /// The worker hit an error outside any handler, usually the store.
    Error {
        queue: String,
        message: String,
    },
    Closed {
        queue: String,
    },
}

impl WorkerEvent {
    pub fn queue(&self) -> &str {
        match self {
            WorkerEvent::Ready { queue }
            | WorkerEvent::Active { queue, .. }
            | WorkerEvent::Completed { queue, .. }
            | WorkerEvent::Retrying { queue, .. }
            | WorkerEvent::RateLimited { queue, .. }
            | WorkerEvent::Failed { queue, .. }
            | WorkerEvent::Error { queue, .. }
            | WorkerEvent::Closed { queue } => queue,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerEvent::Active { job_id, .. }
            | WorkerEvent::Completed { job_id, .. }
            | WorkerEvent::Retrying { job_id, .. }
            | WorkerEvent::RateLimited { job_id, .. }
            | WorkerEvent::Failed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerEvent::Ready { .. } => "ready",
            WorkerEvent::Active { .. } => "active",
            WorkerEvent::Completed { .. } => "completed",
            WorkerEvent::Retrying { .. } => "retrying",
            WorkerEvent::RateLimited { .. } => "rate_limited",
            WorkerEvent::Failed { .. } => "failed",
            WorkerEvent::Error { .. } => "error",
            WorkerEvent::Closed { .. } => "closed",
        };
        write!(f, "{}:{}", self.queue(), name)
    }
}

/// Broadcast hub for worker events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Log every event from `receiver` until the channel closes.
pub fn spawn_event_logger(mut receiver: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::Ready { queue } => info!("Worker ready for queue {}", queue),
        WorkerEvent::Active { queue, job_id, name, attempt } => {
            debug!("[{}] {} {} started (attempt {})", queue, name, job_id, attempt)
        }
        WorkerEvent::Completed { queue, job_id, name, duration_ms, counts } => {
            info!("[{}] {} {} completed in {}ms", queue, name, job_id, duration_ms);
            if let Some(counts) = counts {
                info!("[{}] counts {}", queue, serde_json::json!(counts));
            }
        }
        WorkerEvent::Retrying { queue, job_id, attempts, retry_at, error } => warn!(
            "[{}] {} failed attempt {}, retrying at {}: {}",
            queue, job_id, attempts, retry_at, error
        ),
        WorkerEvent::RateLimited { queue, job_id, retry_after, paused_until } => warn!(
            "[{}] rate limited by {} for {:?}, paused until {}",
            queue, job_id, retry_after, paused_until
        ),
        WorkerEvent::Failed { queue, job_id, attempts, error, counts } => {
            error!("[{}] {} failed after {} attempts: {}", queue, job_id, attempts, error);
            if let Some(counts) = counts {
                info!("[{}] counts {}", queue, serde_json::json!(counts));
            }
        }
        WorkerEvent::Error { queue, message } => error!("[{}] worker error: {}", queue, message),
        WorkerEvent::Closed { queue } => info!("Worker closed for queue {}", queue),
    }
}
