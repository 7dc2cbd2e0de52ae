//! Content-addressed deduplication for externally sourced items.
//!
//! Each candidate is reduced to a canonical identity (a normalized URL or a
//! message id), hashed with SHA-256 and looked up in a [`KeyValueStore`]
//! under `<namespace>:<fingerprint>`. Records expire by TTL only.
//!
//! [`IngestGate::admit`] is check-then-enqueue-then-record and is not atomic:
//! two producers racing on the same fingerprint can both enqueue. A duplicate
//! delivery in that window is accepted.

use crate::{
    FerryworkError, Result,
    job::JobId,
    queue::KeyValueStore,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

/// Default time a fingerprint is remembered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Lowercase hex SHA-256 of a canonical identity.
pub fn fingerprint(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

/// Reduce a link to `origin + path`.
///
/// Query string and fragment are dropped. When `slug_pattern` matches the
/// path, only its first capture group is kept, so
/// `https://example.com/f/123-some-title?src=rss` and
/// `https://example.com/f/123-other-title` canonicalize alike under
/// `(/f/\d+)-`.
pub fn canonicalize_url(raw: &str, slug_pattern: Option<&Regex>) -> Result<String> {
    let url = Url::parse(raw.trim()).map_err(|e| FerryworkError::InvalidJobPayload {
        message: format!("invalid link {:?}: {}", raw, e),
    })?;

    let mut path = url.path().to_string();
    if let Some(captured) = slug_pattern
        .and_then(|pattern| pattern.captures(&path))
        .and_then(|caps| caps.get(1))
    {
        path = captured.as_str().to_string();
    }

    Ok(format!("{}{}", url.origin().ascii_serialization(), path))
}

/// Trim a Message-ID and strip its angle brackets.
pub fn canonicalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Stored alongside a fingerprint for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupRecord {
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Free-form description of what was seen, usually the item itself.
    #[serde(default)]
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupCheck {
    pub already_seen: bool,
}

/// Fingerprint lookups for one namespace.
#[derive(Clone)]
pub struct DedupCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.namespace, fingerprint)
    }

    pub async fn check(&self, fingerprint: &str) -> Result<DedupCheck> {
        let already_seen = self.store.exists(&self.key(fingerprint)).await?;
        Ok(DedupCheck { already_seen })
    }

    pub async fn record(
        &self,
        fingerprint: &str,
        summary: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = DedupRecord {
            fingerprint: fingerprint.to_string(),
            first_seen_at: now,
            ttl_secs: self.ttl.as_secs(),
            summary,
        };
        self.store
            .set_with_ttl(
                &self.key(fingerprint),
                &serde_json::to_string(&record)?,
                self.ttl,
            )
            .await
    }

    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<DedupRecord>> {
        match self.store.get(&self.key(fingerprint)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Forget a fingerprint so the item is accepted again.
    pub async fn forget(&self, fingerprint: &str) -> Result<bool> {
        self.store.delete(&self.key(fingerprint)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued(JobId),
    Duplicate,
}

/// Filters candidates through a [`DedupCache`] before enqueueing them.
#[derive(Clone)]
pub struct IngestGate {
    cache: DedupCache,
}

impl IngestGate {
    pub fn new(cache: DedupCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    /// Enqueue the item unless its fingerprint was seen within the TTL.
    ///
    /// The record is written only after `enqueue` succeeds, so a failed
    /// enqueue leaves the item eligible on the next tick.
    pub async fn admit<F, Fut>(
        &self,
        fingerprint: &str,
        summary: serde_json::Value,
        now: DateTime<Utc>,
        enqueue: F,
    ) -> Result<Admission>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobId>>,
    {
        if self.cache.check(fingerprint).await?.already_seen {
            debug!("Skipping duplicate {}:{}", self.cache.namespace(), fingerprint);
            return Ok(Admission::Duplicate);
        }

        let job_id = enqueue().await?;
        self.cache.record(fingerprint, summary, now).await?;
        Ok(Admission::Enqueued(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::queue::{JobQueue, MemoryQueue};
    use serde_json::json;
    use uuid::Uuid;

    fn slug() -> Regex {
        Regex::new(r"(/f/\d+)-").unwrap()
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint("x"), fingerprint("x"));
        assert_ne!(fingerprint("x"), fingerprint("y"));
    }

    #[test]
    fn test_canonicalize_strips_query_and_slug() {
        let pattern = slug();
        let a = canonicalize_url(
            "https://slickdeals.net/f/17000001-cheap-thing?src=frontpage#comments",
            Some(&pattern),
        )
        .unwrap();
        let b = canonicalize_url("https://slickdeals.net/f/17000001-renamed", Some(&pattern))
            .unwrap();

        assert_eq!(a, "https://slickdeals.net/f/17000001");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonicalize_without_slug_match_keeps_path() {
        let url = canonicalize_url("https://example.com:8443/f/123?x=1", Some(&slug())).unwrap();
        assert_eq!(url, "https://example.com:8443/f/123");
        assert!(canonicalize_url("not a url", None).is_err());
    }

    #[test]
    fn test_canonicalize_message_id() {
        assert_eq!(canonicalize_message_id(" <abc@mail.example> "), "abc@mail.example");
        assert_eq!(canonicalize_message_id("uid-42"), "uid-42");
    }

    #[tokio::test]
    async fn test_check_record_and_forget() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        let cache = DedupCache::new(queue.clone(), "rss");
        let fp = fingerprint("https://example.com/f/1");

        assert!(!cache.check(&fp).await.unwrap().already_seen);
        cache.record(&fp, json!({"title": "t"}), queue.now()).await.unwrap();
        assert!(cache.check(&fp).await.unwrap().already_seen);

        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(record.ttl_secs, DEFAULT_TTL.as_secs());
        assert_eq!(record.summary["title"], "t");

        assert!(cache.forget(&fp).await.unwrap());
        assert!(!cache.check(&fp).await.unwrap().already_seen);
    }

    #[tokio::test]
    async fn test_admit_skips_enqueue_for_duplicates() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        let gate = IngestGate::new(DedupCache::new(queue.clone(), "rss"));
        let fp = fingerprint("https://example.com/f/1");
        let id = Uuid::new_v4();

        let first = gate
            .admit(&fp, json!({}), queue.now(), || async {
                Ok::<_, FerryworkError>(id)
            })
            .await
            .unwrap();
        assert_eq!(first, Admission::Enqueued(id));

        let second = gate
            .admit(&fp, json!({}), queue.now(), || async {
                Err::<JobId, _>(FerryworkError::Queue {
                    message: "duplicate must not be enqueued".to_string(),
                })
            })
            .await
            .unwrap();
        assert_eq!(second, Admission::Duplicate);
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_not_recorded() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        let gate = IngestGate::new(DedupCache::new(queue.clone(), "rss"));
        let fp = fingerprint("https://example.com/f/2");

        let result = gate
            .admit(&fp, json!({}), queue.now(), || async {
                Err::<JobId, _>(FerryworkError::Connection {
                    message: "down".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert!(!gate.cache().check(&fp).await.unwrap().already_seen);
    }
}
