//! Ingest sources.
//!
//! An [`IngestSource`] polls an external system for new items on every tick.
//! [`Ingestor`] turns those candidates into `deliver` jobs, letting only
//! fingerprints the [`IngestGate`] has not seen through.

use crate::{
    Result,
    dedup::{Admission, IngestGate, fingerprint},
    job::{Job, JobOptions},
    payload::{DeliveryItem, JobPayload},
    queue::JobQueue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub mod email;
pub mod rss;

pub use email::{EmailSource, InMemoryMailbox, MailMessage, Mailbox};
pub use rss::RssSource;

/// An item found by a source, before dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateItem {
    /// Canonical identity the fingerprint is computed from.
    pub identity: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl CandidateItem {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.identity)
    }

    pub fn into_delivery(self, source: &str) -> DeliveryItem {
        DeliveryItem {
            fingerprint: self.fingerprint(),
            source: source.to_string(),
            category: self.category,
            title: self.title,
            body: self.body,
            link: self.link,
            author: self.author,
            published_at: self.published_at,
        }
    }
}

#[async_trait]
pub trait IngestSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the current candidates. Called once per tick with no input.
    async fn poll(&self) -> Result<Vec<CandidateItem>>;
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub polled: usize,
    pub enqueued: usize,
    pub duplicates: usize,
}

/// Polls one source and enqueues what is new onto its queue.
#[derive(Clone)]
pub struct Ingestor {
    source: Arc<dyn IngestSource>,
    gate: IngestGate,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    options: JobOptions,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn IngestSource>,
        gate: IngestGate,
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            gate,
            queue,
            queue_name: queue_name.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source(&self) -> &dyn IngestSource {
        self.source.as_ref()
    }

    /// Poll the source once. Store errors abort the tick so the worker
    /// retries it; items admitted before the error stay recorded.
    pub async fn run_tick(&self) -> Result<IngestReport> {
        let candidates = self.source.poll().await?;
        let mut report = IngestReport {
            polled: candidates.len(),
            ..Default::default()
        };
        debug!("{} returned {} candidates", self.source.name(), candidates.len());

        for candidate in candidates {
            let item = candidate.into_delivery(self.source.name());
            let fp = item.fingerprint.clone();
            let summary = serde_json::to_value(&item)?;
            let payload = JobPayload::Deliver(item).to_value()?;
            let now = self.queue.now();

            let admission = self
                .gate
                .admit(&fp, summary, now, || async {
                    let job = Job::new(self.queue_name.clone(), "deliver", payload)
                        .with_options(&self.options)
                        .created_at(now);
                    self.queue.enqueue(job).await
                })
                .await?;

            match admission {
                Admission::Enqueued(job_id) => {
                    debug!("Enqueued {} as job {}", fp, job_id);
                    report.enqueued += 1;
                }
                Admission::Duplicate => report.duplicates += 1,
            }
        }

        if report.enqueued > 0 {
            info!(
                "{}: {} new items, {} already seen",
                self.source.name(),
                report.enqueued,
                report.duplicates
            );
        }
        Ok(report)
    }
}
