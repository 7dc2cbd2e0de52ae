//! Delivery sinks.
//!
//! A [`DeliverySink`] performs the outward send for one [`DeliveryItem`].
//! Sinks report downstream throttling as [`HandlerError::RateLimited`] so the
//! worker can pause instead of burning retry attempts.

use crate::{
    Result,
    error::HandlerError,
    payload::DeliveryItem,
    queue::KeyValueStore,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub mod telegram;

pub use telegram::TelegramSink;

/// Longest body a sink sends before cutting it.
pub const BODY_LIMIT: usize = 3800;

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Truncate to `limit` characters, appending a marker when cut.
pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{}", &body[..cut], TRUNCATION_MARKER),
        None => body.to_string(),
    }
}

/// Plain-text rendering shared by sinks: title, body, then link, separated by
/// blank lines.
pub fn render_text(item: &DeliveryItem) -> String {
    let mut parts = Vec::with_capacity(3);
    if !item.title.trim().is_empty() {
        parts.push(item.title.trim().to_string());
    }
    if !item.body.trim().is_empty() {
        parts.push(truncate_body(item.body.trim(), BODY_LIMIT));
    }
    if let Some(link) = item.link.as_deref().filter(|l| !l.is_empty()) {
        parts.push(link.to_string());
    }
    parts.join("\n\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub sink: String,
    /// Identifier the remote side assigned, when it returns one.
    pub message_id: Option<i64>,
}

impl DeliveryReceipt {
    /// `sink:message_id`, e.g. `telegram:4711`.
    pub fn note(&self) -> String {
        match self.message_id {
            Some(id) => format!("{}:{}", self.sink, id),
            None => self.sink.clone(),
        }
    }
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    /// Verify credentials and reachability. Returns a description of the
    /// remote identity.
    async fn check(&self) -> Result<String>;

    async fn deliver(&self, item: &DeliveryItem) -> std::result::Result<DeliveryReceipt, HandlerError>;

    /// Send a keyword-watch alert for an item that was already delivered.
    async fn alert(
        &self,
        item: &DeliveryItem,
        matched: &[String],
    ) -> std::result::Result<DeliveryReceipt, HandlerError>;
}

/// Case-insensitive keyword matching over delivered items.
///
/// Keywords come from the configuration and from a JSON array stored at
/// `<namespace>:filters`, which can be edited while the relay runs.
#[derive(Clone)]
pub struct KeywordWatch {
    store: Option<Arc<dyn KeyValueStore>>,
    key: String,
    keywords: Vec<String>,
}

impl KeywordWatch {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            store: None,
            key: String::new(),
            keywords: normalize(keywords),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        self.store = Some(store);
        self.key = format!("{}:filters", namespace);
        self
    }

    /// Configured keywords plus the stored list. A missing or malformed
    /// stored list is treated as empty.
    pub async fn keywords(&self) -> Result<Vec<String>> {
        let mut keywords = self.keywords.clone();
        if let Some(store) = &self.store {
            if let Some(raw) = store.get(&self.key).await? {
                match serde_json::from_str::<Vec<String>>(&raw) {
                    Ok(stored) => keywords.extend(normalize(stored)),
                    Err(e) => warn!("Ignoring malformed keyword list at {}: {}", self.key, e),
                }
            }
        }
        keywords.sort();
        keywords.dedup();
        Ok(keywords)
    }

    /// Keywords found in the item's title or body.
    pub async fn matches(&self, item: &DeliveryItem) -> Result<Vec<String>> {
        let keywords = self.keywords().await?;
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let title = item.title.to_lowercase();
        let body = item.body.to_lowercase();
        Ok(keywords
            .into_iter()
            .filter(|word| title.contains(word.as_str()) || body.contains(word.as_str()))
            .collect())
    }
}

fn normalize(keywords: Vec<String>) -> Vec<String> {
    keywords
        .into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use std::time::Duration;

    fn item(title: &str, body: &str) -> DeliveryItem {
        DeliveryItem {
            fingerprint: "fp".to_string(),
            source: "slickdeals".to_string(),
            category: "slickdeals-frontpage".to_string(),
            title: title.to_string(),
            body: body.to_string(),
            link: Some("https://slickdeals.net/f/1".to_string()),
            author: None,
            published_at: None,
        }
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("abcdef", 3), "abc... [truncated]");
        // Counted in characters, not bytes.
        assert_eq!(truncate_body("ééééé", 2), "éé... [truncated]");
        assert_eq!(truncate_body(&"x".repeat(BODY_LIMIT), BODY_LIMIT).len(), BODY_LIMIT);
    }

    #[test]
    fn test_render_text() {
        assert_eq!(
            render_text(&item("Widget", "Now $5")),
            "Widget\n\nNow $5\n\nhttps://slickdeals.net/f/1"
        );
        let mut bare = item("Widget", "  ");
        bare.link = None;
        assert_eq!(render_text(&bare), "Widget");
    }

    #[test]
    fn test_receipt_note() {
        let receipt = DeliveryReceipt {
            sink: "telegram".to_string(),
            message_id: Some(42),
        };
        assert_eq!(receipt.note(), "telegram:42");
    }

    #[tokio::test]
    async fn test_keyword_matching_merges_stored_list() {
        let store = Arc::new(MemoryQueue::new());
        store
            .set_with_ttl("telegram:details:filters", r#"["SSD", "monitor"]"#, Duration::from_secs(60))
            .await
            .unwrap();

        let watch = KeywordWatch::new(vec!["Widget".to_string(), " ".to_string()])
            .with_store(store, "telegram:details");
        assert_eq!(watch.keywords().await.unwrap(), vec!["monitor", "ssd", "widget"]);

        let matched = watch.matches(&item("2TB ssd deal", "Great for a WIDGET")).await.unwrap();
        assert_eq!(matched, vec!["ssd", "widget"]);
        assert!(watch.matches(&item("Shoes", "")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_stored_list_is_ignored() {
        let store = Arc::new(MemoryQueue::new());
        store
            .set_with_ttl("ns:filters", "not json", Duration::from_secs(60))
            .await
            .unwrap();
        let watch = KeywordWatch::new(vec!["tv".to_string()]).with_store(store, "ns");
        assert_eq!(watch.keywords().await.unwrap(), vec!["tv"]);
    }
}
