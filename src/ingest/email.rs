//! Email as an ingest source.
//!
//! The mailbox transport itself (IMAP, OAuth) lives behind the [`Mailbox`]
//! trait. [`EmailSource`] filters senders and derives a stable identity from
//! the Message-ID.

use crate::{
    Result,
    config::EmailSourceConfig,
    dedup::canonicalize_message_id,
    delivery::{BODY_LIMIT, truncate_body},
    ingest::{CandidateItem, IngestSource},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub date: Option<DateTime<Utc>>,
}

impl MailMessage {
    /// Message-ID without angle brackets, or `uid-<uid>` when absent.
    pub fn identity(&self) -> String {
        self.message_id
            .as_deref()
            .map(canonicalize_message_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("uid-{}", self.uid))
    }

    /// `Name <address>` or just the address.
    pub fn sender_display(&self) -> String {
        match self.from_name.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => format!("{} <{}>", name, self.from_address),
            None => self.from_address.clone(),
        }
    }
}

/// Source of unread messages.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn fetch_unread(&self) -> Result<Vec<MailMessage>>;

    /// Flag messages so the next fetch does not return them.
    async fn mark_seen(&self, uids: &[u32]) -> Result<()>;
}

pub struct EmailSource {
    name: String,
    category: String,
    allowed_senders: Vec<String>,
    mailbox: Arc<dyn Mailbox>,
}

impl EmailSource {
    pub fn new(name: impl Into<String>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            name: name.into(),
            category: "email".to_string(),
            allowed_senders: Vec::new(),
            mailbox,
        }
    }

    pub fn from_config(config: &EmailSourceConfig, mailbox: Arc<dyn Mailbox>) -> Self {
        Self::new(config.name.clone(), mailbox)
            .with_category(config.category.clone())
            .with_allowed_senders(config.allowed_senders.iter().cloned())
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_allowed_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_senders = senders
            .into_iter()
            .map(|s| s.into().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    /// An empty allow-list accepts everyone.
    pub fn is_allowed(&self, address: &str) -> bool {
        if self.allowed_senders.is_empty() {
            return true;
        }
        let address = address.trim().to_lowercase();
        !address.is_empty() && self.allowed_senders.contains(&address)
    }

    fn candidate(&self, message: MailMessage) -> CandidateItem {
        let title = message
            .subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(No Subject)".to_string());
        let sender = message.sender_display();
        let body = if message.body.trim().is_empty() {
            format!("From: {}", sender)
        } else {
            format!("From: {}\n\n{}", sender, truncate_body(message.body.trim(), BODY_LIMIT))
        };
        CandidateItem {
            identity: message.identity(),
            category: self.category.clone(),
            title,
            body,
            link: None,
            author: Some(sender),
            published_at: message.date,
        }
    }
}

#[async_trait]
impl IngestSource for EmailSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// Allowed messages are marked seen as part of the poll; rejected ones
    /// are left unread.
    async fn poll(&self) -> Result<Vec<CandidateItem>> {
        let messages = self.mailbox.fetch_unread().await?;
        if messages.is_empty() {
            debug!("{}: no unread mail", self.name);
            return Ok(Vec::new());
        }
        info!("{}: {} unread messages", self.name, messages.len());

        let mut seen = Vec::new();
        let mut candidates = Vec::new();
        for message in messages {
            if !self.is_allowed(&message.from_address) {
                debug!("{}: skipping mail from {}", self.name, message.from_address);
                continue;
            }
            seen.push(message.uid);
            candidates.push(self.candidate(message));
        }

        if !seen.is_empty() {
            self.mailbox.mark_seen(&seen).await?;
        }
        Ok(candidates)
    }
}

/// Mailbox held in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryMailbox {
    messages: Mutex<Vec<(MailMessage, bool)>>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, message: MailMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((message, false));
    }

    pub fn unread_count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, seen)| !seen)
            .count()
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn fetch_unread(&self) -> Result<Vec<MailMessage>> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, seen)| !seen)
            .map(|(message, _)| message.clone())
            .collect())
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<()> {
        for (message, seen) in self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter_mut()
        {
            if uids.contains(&message.uid) {
                *seen = true;
            }
        }
        Ok(())
    }
}
