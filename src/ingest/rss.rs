//! RSS and Atom feeds over HTTP.
//!
//! Documents are read with `quick-xml`'s event reader. Only `<item>` and
//! `<entry>` elements and their direct children are kept. Links are
//! canonicalized before fingerprinting, so a deal re-posted with a new slug or
//! tracking query is recognized.

use crate::{
    FerryworkError, Result,
    config::{FeedConfig, RssSourceConfig},
    dedup::canonicalize_url,
    ingest::{CandidateItem, IngestSource},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::{
    Reader,
    escape::{resolve_html5_entity, unescape_with},
    events::{BytesStart, Event},
};
use regex::Regex;
use std::{borrow::Cow, collections::HashMap, time::Duration};
use tracing::{debug, info, warn};

/// One `<item>` or `<entry>` as found in the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Extracts entries from RSS 2.0, RSS 1.0 and Atom documents.
#[derive(Debug, Clone)]
pub struct FeedParser {
    tag: Regex,
}

/// Text collected for the children of one entry, keyed by qualified name.
#[derive(Debug, Default)]
struct RawEntry {
    atom: bool,
    fields: HashMap<String, String>,
    href: Option<String>,
    child: Option<String>,
    buffer: String,
}

impl RawEntry {
    fn new(atom: bool) -> Self {
        Self {
            atom,
            ..Self::default()
        }
    }

    fn open_child(&mut self, start: &BytesStart<'_>) {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        if self.atom && name == "link" && self.href.is_none() {
            self.href = alternate_href(start);
        }
        self.buffer.clear();
        // Later duplicates of a child are ignored.
        self.child = (!self.fields.contains_key(&name)).then_some(name);
    }

    fn push_text(&mut self, text: &str) {
        if self.child.is_none() || text.is_empty() {
            return;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(text);
    }

    fn close_child(&mut self) {
        if let Some(name) = self.child.take() {
            self.fields.insert(name, self.buffer.trim().to_string());
        }
        self.buffer.clear();
    }

    /// First non-empty field among `names`.
    fn field(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.fields.get(*name))
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }
}

/// `href` of an Atom `<link>` whose `rel` is absent or `alternate`.
fn alternate_href(start: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut alternate = true;
    for attr in start.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"rel" => alternate = value == "alternate",
            _ => {}
        }
    }
    href.filter(|_| alternate)
}

/// Resolve XML, HTML and numeric character references. Text with a stray
/// `&` is kept as written.
fn decode(raw: &str) -> String {
    unescape_with(raw, resolve_html5_entity)
        .unwrap_or(Cow::Borrowed(raw))
        .into_owned()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl FeedParser {
    pub fn new() -> Result<Self> {
        let tag = Regex::new(r"(?s)<[^>]+>")
            .map_err(|e| FerryworkError::Config(format!("markup pattern: {}", e)))?;
        Ok(Self { tag })
    }

    /// Entries in document order. Entries without a link are dropped.
    pub fn parse(&self, document: &str) -> Result<Vec<FeedEntry>> {
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(true);

        let mut entries = Vec::new();
        let mut current: Option<RawEntry> = None;
        // Element depth below the open entry.
        let mut depth = 0usize;

        loop {
            match reader.read_event()? {
                Event::Start(start) => match current.as_mut() {
                    Some(entry) => {
                        if depth == 0 {
                            entry.open_child(&start);
                        }
                        depth += 1;
                    }
                    None => match start.local_name().as_ref() {
                        b"item" => current = Some(RawEntry::new(false)),
                        b"entry" => current = Some(RawEntry::new(true)),
                        _ => {}
                    },
                },
                Event::Empty(start) => {
                    if let Some(entry) = current.as_mut().filter(|_| depth == 0) {
                        entry.open_child(&start);
                        entry.close_child();
                    }
                }
                Event::Text(text) => {
                    if let Some(entry) = current.as_mut() {
                        entry.push_text(&decode(&String::from_utf8_lossy(&text.into_inner())));
                    }
                }
                Event::CData(data) => {
                    if let Some(entry) = current.as_mut() {
                        entry.push_text(&decode(&String::from_utf8_lossy(&data.into_inner())));
                    }
                }
                Event::End(_) => {
                    if current.is_some() {
                        if depth == 0 {
                            entries.extend(current.take());
                        } else {
                            depth -= 1;
                            if depth == 0 {
                                if let Some(entry) = current.as_mut() {
                                    entry.close_child();
                                }
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(entries.into_iter().filter_map(|raw| self.entry(raw)).collect())
    }

    fn entry(&self, raw: RawEntry) -> Option<FeedEntry> {
        let link = if raw.atom {
            raw.href.clone()
        } else {
            raw.field(&["link"]).map(str::to_string)
        }?;

        let title = raw.field(&["title"]).map(collapse_whitespace).unwrap_or_default();
        let description = raw
            .field(&["description", "summary", "content:encoded", "content"])
            .map(|html| self.strip_tags(html))
            .unwrap_or_default();
        let author = raw
            .field(&["dc:creator", "author"])
            .map(|author| self.strip_tags(author))
            .filter(|author| !author.is_empty());
        let published_at = raw
            .field(&["pubDate", "published", "updated", "dc:date"])
            .and_then(parse_date);

        Some(FeedEntry {
            title,
            link,
            description,
            author,
            published_at,
        })
    }

    /// Drop markup left in HTML bodies. Entities were resolved when the text
    /// was read, so escaped markup is removed here as well.
    fn strip_tags(&self, html: &str) -> String {
        collapse_whitespace(&self.tag.replace_all(html, " "))
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Polls a group of feeds that share one queue.
pub struct RssSource {
    name: String,
    feeds: Vec<FeedConfig>,
    slug_pattern: Option<Regex>,
    parser: FeedParser,
    client: reqwest::Client,
}

impl RssSource {
    pub fn new(name: impl Into<String>, feeds: Vec<FeedConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("ferrywork/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name: name.into(),
            feeds,
            slug_pattern: None,
            parser: FeedParser::new()?,
            client,
        })
    }

    pub fn from_config(config: &RssSourceConfig) -> Result<Self> {
        let mut source = Self::new(config.name.clone(), config.feeds.clone())?;
        source.slug_pattern = config.slug_regex()?;
        Ok(source)
    }

    pub fn with_slug_pattern(mut self, pattern: Regex) -> Self {
        self.slug_pattern = Some(pattern);
        self
    }

    pub fn feeds(&self) -> &[FeedConfig] {
        &self.feeds
    }

    /// Candidates from one fetched document. Entries whose link cannot be
    /// parsed are skipped; a malformed document is an error.
    pub fn candidates(&self, feed: &FeedConfig, document: &str) -> Result<Vec<CandidateItem>> {
        Ok(self
            .parser
            .parse(document)?
            .into_iter()
            .filter_map(|entry| {
                let link = match canonicalize_url(&entry.link, self.slug_pattern.as_ref()) {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("{}: skipping entry {:?}: {}", feed.name, entry.title, e);
                        return None;
                    }
                };
                Some(CandidateItem {
                    identity: link.clone(),
                    category: feed.name.clone(),
                    title: entry.title,
                    body: entry.description,
                    link: Some(link),
                    author: entry.author,
                    published_at: entry.published_at,
                })
            })
            .collect())
    }

    async fn fetch(&self, feed: &FeedConfig) -> Result<Vec<CandidateItem>> {
        let response = self.client.get(&feed.url).send().await?.error_for_status()?;
        let document = response.text().await?;
        self.candidates(feed, &document)
    }
}

#[async_trait]
impl IngestSource for RssSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// A feed that fails to load or parse is skipped; the tick fails only
    /// when every feed does.
    async fn poll(&self) -> Result<Vec<CandidateItem>> {
        info!(
            "Fetching {}: {}",
            self.name,
            self.feeds.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        let mut candidates = Vec::new();
        let mut last_error = None;
        let mut loaded = 0;
        for feed in &self.feeds {
            match self.fetch(feed).await {
                Ok(found) => {
                    loaded += 1;
                    debug!("{}: {} entries", feed.name, found.len());
                    candidates.extend(found);
                }
                Err(e) => {
                    warn!("Failed to read feed {} ({}): {}", feed.name, feed.url, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if loaded == 0 => Err(e),
            _ => Ok(candidates),
        }
    }
}
