//! Configuration types for the CVE sync engine
//!
//! This module defines all configuration structures used throughout the crate.

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::feed::MAX_PAGE_SIZE;

/// Default upstream endpoint (NVD CVE API 2.0)
pub const DEFAULT_FEED_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Main sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CveSyncConfig {
    /// Upstream feed settings
    #[serde(default)]
    pub feed: FeedConfig,

    /// Record store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Timer settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CveSyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.feed.validate()?;
        self.store.validate()?;
        self.scheduler.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Upstream feed configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Feed endpoint
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// API key sent with every request; raises the upstream rate limit
    #[serde(default)]
    pub api_key: Option<String>,

    /// Records per page, at most 2000
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Timeout of one page request (in seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delay between consecutive page requests (in milliseconds)
    ///
    /// When unset, 6000 without an API key and 600 with one.
    #[serde(default)]
    pub page_delay_ms: Option<u64>,

    /// Per-page retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl FeedConfig {
    /// Validate the feed configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.url.is_empty() {
            return Err(crate::Error::config("Feed URL cannot be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(crate::Error::config(format!(
                "Feed URL must start with http:// or https:// (got '{}')",
                self.url
            )));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(crate::Error::config(format!(
                "Page size must be between 1 and {} (got {})",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(crate::Error::config("Request timeout must be > 0"));
        }
        if let Some(key) = &self.api_key
            && key.trim().is_empty()
        {
            return Err(crate::Error::config("API key cannot be blank when set"));
        }
        self.retry.validate()
    }

    /// Delay to wait between two page requests
    pub fn effective_page_delay(&self) -> Duration {
        let ms = self.page_delay_ms.unwrap_or(if self.api_key.is_some() {
            default_page_delay_with_key_ms()
        } else {
            default_page_delay_anonymous_ms()
        });
        Duration::from_millis(ms)
    }

    /// Timeout of one page request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            api_key: None,
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
            page_delay_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("page_size", &self.page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("page_delay_ms", &self.page_delay_ms)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Per-page retry policy
///
/// Exponential backoff with jitter for transient failures; a fixed or
/// upstream-provided wait for rate limiting. Both share one attempt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff step (in milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap for a single backoff step, and for upstream-requested waits
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Wait after a rate-limit signal that carried no delay
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that retries immediately; for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            rate_limit_delay_ms: 0,
        }
    }

    /// Validate the retry policy
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(crate::Error::config(format!(
                "Retry base delay ({} ms) exceeds max delay ({} ms)",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Backoff before retry number `retry` (0-indexed)
    ///
    /// `min(base * 2^retry, max) + jitter(0..base)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp_delay = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_delay.min(self.max_delay_ms);
        let jitter = if self.base_delay_ms > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    /// Wait after a rate-limit signal
    pub fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) => requested.min(Duration::from_millis(self.max_delay_ms)),
            None => Duration::from_millis(self.rate_limit_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// JSON snapshot on disk
    File {
        /// Path to the snapshot file
        path: String,
    },
}

impl StoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StoreConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("File store path cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Get the store type name
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::File { .. } => "file",
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between the starts of two automatic syncs (in seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Delay before the first automatic sync (in seconds)
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,

    /// Fetch only records modified since the last successful sync
    ///
    /// Falls back to a full sync when there is no such sync, or it started
    /// more than 120 days ago.
    #[serde(default)]
    pub incremental: bool,
}

impl SchedulerConfig {
    /// Validate the scheduler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Sync interval must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            startup_delay_secs: default_startup_delay_secs(),
            incremental: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the sync event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_delay_anonymous_ms() -> u64 {
    6000
}

fn default_page_delay_with_key_ms() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_rate_limit_delay_ms() -> u64 {
    30_000
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_startup_delay_secs() -> u64 {
    0
}

fn default_event_channel_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = CveSyncConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.feed.page_size, 2000);
        assert_eq!(config.scheduler.interval(), Duration::from_secs(86_400));
        assert_eq!(config.engine.event_channel_capacity, 1000);
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "feed": {"api_key": "abc", "page_size": 500},
            "store": {"type": "file", "path": "/var/lib/cvesync/records.json"},
            "scheduler": {"incremental": true}
        }"#;
        let config: CveSyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.feed.page_size, 500);
        assert_eq!(config.feed.url, DEFAULT_FEED_URL);
        assert_eq!(config.store.type_name(), "file");
        assert!(config.scheduler.incremental);
        assert_eq!(config.scheduler.interval_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        let mut feed = FeedConfig::default();
        feed.page_size = 2001;
        assert!(feed.validate().is_err());
        feed.page_size = 0;
        assert!(feed.validate().is_err());
    }

    #[test]
    fn test_page_delay_depends_on_api_key() {
        let mut feed = FeedConfig::default();
        assert_eq!(feed.effective_page_delay(), Duration::from_secs(6));
        feed.api_key = Some("key".into());
        assert_eq!(feed.effective_page_delay(), Duration::from_millis(600));
        feed.page_delay_ms = Some(0);
        assert_eq!(feed.effective_page_delay(), Duration::ZERO);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut feed = FeedConfig::default();
        feed.api_key = Some("super-secret".into());
        let debug = format!("{:?}", feed);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<REDACTED>"));
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            rate_limit_delay_ms: 0,
        };
        let d = policy.delay_for_retry(0).as_millis();
        assert!((100..200).contains(&d));
        let d = policy.delay_for_retry(2).as_millis();
        assert!((400..500).contains(&d));
        // Capped before jitter
        let d = policy.delay_for_retry(10).as_millis();
        assert!((1000..1100).contains(&d));
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(63), Duration::ZERO);
        assert_eq!(policy.rate_limit_delay(None), Duration::ZERO);
    }

    #[test]
    fn test_rate_limit_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.rate_limit_delay(Some(Duration::from_secs(3600))),
            Duration::from_millis(policy.max_delay_ms)
        );
        assert_eq!(
            policy.rate_limit_delay(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.rate_limit_delay(None),
            Duration::from_millis(policy.rate_limit_delay_ms)
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let scheduler = SchedulerConfig {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(scheduler.validate().is_err());
    }
}
