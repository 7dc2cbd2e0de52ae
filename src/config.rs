//! Configuration for the relay runtime.
//!
//! A [`FerryworkConfig`] is read from TOML and then overridden by
//! `FERRYWORK_*` environment variables. Durations are written the way people
//! say them: `"500ms"`, `"30s"`, `"5m"`, `"7d"`, or a plain number of
//! seconds.

use crate::{
    FerryworkError, Result,
    cron::CronSchedule,
    job::JobOptions,
    rate_limit::RateLimit,
    retry::BackoffPolicy,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};

/// Serde helpers for `std::time::Duration` as human-readable strings.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    impl Raw {
        fn into_duration(self) -> Result<Duration, String> {
            match self {
                Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
                Raw::Text(text) => parse_duration(&text),
            }
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Raw::deserialize(deserializer)?
            .into_duration()
            .map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() != 0 {
            return format!("{}ms", duration.as_millis());
        }
        let secs = duration.as_secs();
        if secs == 0 {
            "0s".to_string()
        } else if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"7d"` or `"90"` (seconds).
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            let millis: u64 = millis
                .trim()
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", s))?;
            return Ok(Duration::from_millis(millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let multiplier = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => return Err(format!("Invalid duration suffix: {}", suffix)),
        };
        num.checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;

            Option::<Raw>::deserialize(deserializer)?
                .map(|raw| raw.into_duration().map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Parse `name:id;name:id` into a category -> thread id map. Malformed
/// entries are skipped.
pub fn parse_thread_ids(input: &str) -> BTreeMap<String, i64> {
    input
        .split(';')
        .filter_map(|entry| {
            let (name, id) = entry.split_once(':')?;
            let name = name.trim();
            let id = id.trim().parse::<i64>().ok()?;
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), id))
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FerryworkConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub jobs: JobOptions,
    pub dedup: DedupConfig,
    pub telegram: TelegramConfig,
    pub dashboard: DashboardConfig,
    pub sources: SourcesConfig,
}

impl FerryworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_url(mut self, url: &str) -> Self {
        self.store.url = url.to_string();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.jobs.max_attempts = max_attempts;
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read `path` when it exists (defaults otherwise), then apply the
    /// environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FERRYWORK_*` overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| FerryworkError::Config(format!("{} has an invalid value: {:?}", key, value)))
        }

        if let Some(url) = lookup("FERRYWORK_STORE_URL") {
            self.store.url = url;
        }

        if let Some(value) = lookup("FERRYWORK_CONCURRENCY") {
            self.worker.concurrency = parsed("FERRYWORK_CONCURRENCY", value)?;
        }
        if let Some(value) = lookup("FERRYWORK_LIMITER_MAX") {
            self.worker.limiter_max = parsed("FERRYWORK_LIMITER_MAX", value)?;
        }
        if let Some(value) = lookup("FERRYWORK_LIMITER_DURATION_MS") {
            let millis: u64 = parsed("FERRYWORK_LIMITER_DURATION_MS", value)?;
            self.worker.limiter_duration = Duration::from_millis(millis);
        }

        if let Some(value) = lookup("FERRYWORK_MAX_ATTEMPTS") {
            self.jobs.max_attempts = parsed("FERRYWORK_MAX_ATTEMPTS", value)?;
        }
        let backoff_delay = match lookup("FERRYWORK_BACKOFF_DELAY_MS") {
            Some(value) => {
                let millis: u64 = parsed("FERRYWORK_BACKOFF_DELAY_MS", value)?;
                Some(Duration::from_millis(millis))
            }
            None => None,
        };
        let backoff_type = lookup("FERRYWORK_BACKOFF_TYPE");
        if backoff_delay.is_some() || backoff_type.is_some() {
            let delay = backoff_delay.unwrap_or_else(|| self.jobs.backoff.base_delay());
            self.jobs.backoff = match backoff_type.as_deref().map(str::trim) {
                Some("fixed") => BackoffPolicy::fixed(delay),
                Some("exponential") => BackoffPolicy::exponential(delay),
                None => match self.jobs.backoff {
                    BackoffPolicy::Fixed { .. } => BackoffPolicy::fixed(delay),
                    BackoffPolicy::Exponential { max_delay, .. } => BackoffPolicy::Exponential { delay, max_delay },
                },
                Some(other) => {
                    return Err(FerryworkError::Config(format!(
                        "FERRYWORK_BACKOFF_TYPE must be fixed or exponential, got {:?}",
                        other
                    )));
                }
            };
        }
        if let Some(value) = lookup("FERRYWORK_REMOVE_ON_COMPLETE_AGE") {
            self.jobs.remove_on_complete.age = Some(parsed("FERRYWORK_REMOVE_ON_COMPLETE_AGE", value)?);
        }
        if let Some(value) = lookup("FERRYWORK_REMOVE_ON_COMPLETE_COUNT") {
            self.jobs.remove_on_complete.count = Some(parsed("FERRYWORK_REMOVE_ON_COMPLETE_COUNT", value)?);
        }
        if let Some(value) = lookup("FERRYWORK_REMOVE_ON_FAIL_COUNT") {
            self.jobs.remove_on_fail.count = Some(parsed("FERRYWORK_REMOVE_ON_FAIL_COUNT", value)?);
        }

        if let Some(value) = lookup("FERRYWORK_DEDUP_TTL_SECONDS") {
            let secs: u64 = parsed("FERRYWORK_DEDUP_TTL_SECONDS", value)?;
            self.dedup.ttl = Duration::from_secs(secs);
        }

        if let Some(token) = lookup("FERRYWORK_TELEGRAM_TOKEN") {
            self.telegram.token = token;
        }
        if let Some(chat_id) = lookup("FERRYWORK_TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = chat_id;
        }
        if let Some(threads) = lookup("FERRYWORK_TELEGRAM_THREAD_IDS") {
            self.telegram.thread_ids = parse_thread_ids(&threads);
        }

        if let Some(value) = lookup("FERRYWORK_DASHBOARD_PORT") {
            self.dashboard.port = parsed("FERRYWORK_DASHBOARD_PORT", value)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(FerryworkError::Config("worker.concurrency must be at least 1".to_string()));
        }
        if self.jobs.max_attempts == 0 {
            return Err(FerryworkError::Config("jobs.max_attempts must be at least 1".to_string()));
        }
        if self.worker.limiter_max > 0 && self.worker.limiter_duration.is_zero() {
            return Err(FerryworkError::Config(
                "worker.limiter_duration must be positive when the limiter is enabled".to_string(),
            ));
        }
        if !self.store.memory && self.store.url.trim().is_empty() {
            return Err(FerryworkError::Config("store.url is required".to_string()));
        }

        let mut names = std::collections::HashSet::new();
        for source in &self.sources.rss {
            source.schedule()?;
            source.slug_regex()?;
            if source.feeds.is_empty() {
                return Err(FerryworkError::Config(format!("rss source {} has no feeds", source.name)));
            }
            if !names.insert(source.name.as_str()) {
                return Err(FerryworkError::Config(format!("duplicate source name {}", source.name)));
            }
        }
        for source in &self.sources.email {
            source.schedule()?;
            if !names.insert(source.name.as_str()) {
                return Err(FerryworkError::Config(format!("duplicate source name {}", source.name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    /// Namespace for every key the queue writes.
    pub prefix: String,
    /// Keep everything in process memory instead of Redis.
    pub memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "ferrywork".to_string(),
            memory: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_timeout: Option<Duration>,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    /// Jobs started per `limiter_duration`. Zero disables the limiter.
    pub limiter_max: u64,
    #[serde(with = "duration_str")]
    pub limiter_duration: Duration,
}

impl WorkerConfig {
    pub fn rate_limit(&self) -> Option<RateLimit> {
        if self.limiter_max == 0 {
            None
        } else {
            Some(RateLimit::new(self.limiter_max, self.limiter_duration))
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_secs(1),
            job_timeout: Some(Duration::from_secs(60)),
            shutdown_timeout: Duration::from_secs(30),
            limiter_max: 10,
            limiter_duration: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: crate::dedup::DEFAULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    /// Prefix for the keyword-watch list stored at `<namespace>:filters`.
    pub namespace: String,
    pub api_base: String,
    /// Keywords watched in addition to the stored list.
    pub keywords: Vec<String>,
    /// Category -> message id that new posts reply to.
    pub thread_ids: BTreeMap<String, i64>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            chat_id: String::new(),
            namespace: "telegram:details".to_string(),
            api_base: "https://api.telegram.org".to_string(),
            keywords: Vec::new(),
            thread_ids: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl DashboardConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    pub email: Vec<EmailSourceConfig>,
    pub rss: Vec<RssSourceConfig>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            email: Vec::new(),
            rss: vec![RssSourceConfig::default()],
        }
    }
}

/// One RSS queue. Every feed in it is polled on the same tick and its name
/// doubles as the delivery category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RssSourceConfig {
    /// Queue name and dedup namespace.
    pub name: String,
    #[serde(default = "default_rss_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub slug_pattern: Option<String>,
    pub feeds: Vec<FeedConfig>,
}

impl RssSourceConfig {
    pub fn schedule(&self) -> Result<CronSchedule> {
        Ok(CronSchedule::with_timezone(&self.cron, &self.timezone)?)
    }

    pub fn slug_regex(&self) -> Result<Option<Regex>> {
        self.slug_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    FerryworkError::Config(format!("invalid slug pattern for {}: {}", self.name, e))
                })
            })
            .transpose()
    }
}

impl Default for RssSourceConfig {
    fn default() -> Self {
        Self {
            name: "slickdeals".to_string(),
            cron: default_rss_cron(),
            timezone: default_timezone(),
            slug_pattern: Some(r"(/f/\d*)-".to_string()),
            feeds: vec![
                FeedConfig::new(
                    "slickdeals-frontpage",
                    "https://slickdeals.net/newsearch.php?mode=frontpage&searcharea=deals&searchin=first&rss=1",
                ),
                FeedConfig::new(
                    "slickdeals-popular",
                    "https://slickdeals.net/newsearch.php?mode=popdeals&searcharea=deals&searchin=first&rss=1",
                ),
                FeedConfig::new("slickdeals-trending", "https://feeds.feedburner.com/SlickdealsnetUP"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

impl FeedConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailSourceConfig {
    pub name: String,
    #[serde(default = "default_email_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Empty accepts every sender.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Delivery category, used for thread routing.
    #[serde(default = "default_email_category")]
    pub category: String,
}

impl EmailSourceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cron: default_email_cron(),
            timezone: default_timezone(),
            allowed_senders: Vec::new(),
            category: default_email_category(),
        }
    }

    pub fn schedule(&self) -> Result<CronSchedule> {
        Ok(CronSchedule::with_timezone(&self.cron, &self.timezone)?)
    }
}

fn default_rss_cron() -> String {
    "0 */15 * * * *".to_string()
}

fn default_email_cron() -> String {
    "0 */1 * * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_email_category() -> String {
    "email".to_string()
}
