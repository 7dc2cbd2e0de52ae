//! Job payloads carried by relay queues.

use crate::{Result, job::Job};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An item ready to be sent to a sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryItem {
    /// Dedup fingerprint of the item's canonical identity.
    pub fingerprint: String,
    /// Queue the item was ingested on.
    pub source: String,
    /// Routing key for the sink, e.g. the feed name.
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// Work on a relay queue. One handler serves both kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Poll the queue's ingest source.
    Tick { source: String },
    Deliver(DeliveryItem),
}

impl JobPayload {
    pub fn tick(source: impl Into<String>) -> Self {
        JobPayload::Tick {
            source: source.into(),
        }
    }

    /// Job name used when the payload is enqueued.
    pub fn job_name(&self) -> &'static str {
        match self {
            JobPayload::Tick { .. } => "tick",
            JobPayload::Deliver(_) => "deliver",
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_job(job: &Job) -> Result<Self> {
        job.payload_as()
    }
}
