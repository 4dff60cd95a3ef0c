//! Core configuration types for crawl sessions
//!
//! This module contains the main `CrawlConfig` struct describing one crawl
//! invocation: seeds, scope, politeness, limits, and archive location.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How pages are fetched and rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Single HTTP GET, no browser
    Raw,
    /// Browser navigation with network-idle wait, DOM serialization
    Prerender,
    /// Prerender plus post-load performance and accessibility audits
    Full,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Prerender => f.write_str("prerender"),
            Self::Full => f.write_str("full"),
        }
    }
}

impl FromStr for FetchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "prerender" => Ok(Self::Prerender),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown fetch mode '{other}' (raw|prerender|full)")),
        }
    }
}

/// Main configuration struct for a crawl session
///
/// Construct through [`CrawlConfig::builder`], which validates seeds and
/// compiles exclusion patterns once up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Seed URLs, absolute http(s). Depth 0.
    pub(crate) seeds: Vec<String>,

    /// Output directory for the Atlas archive.
    ///
    /// **INVARIANT:** Always an absolute path (normalized in builder).
    pub(crate) out_dir: PathBuf,

    pub(crate) mode: FetchMode,
    pub(crate) max_pages: Option<usize>,
    pub(crate) max_depth: u32,

    /// Global concurrency cap on in-flight fetches
    pub(crate) parallel: usize,

    /// Maximum concurrent fetches per host
    pub(crate) max_per_host: usize,

    /// Minimum inter-request delay per host, in milliseconds.
    /// Robots `Crawl-delay` overrides this when present and larger.
    pub(crate) host_delay_ms: u64,

    /// Retry attempts for transient fetch failures
    pub(crate) max_retries: u32,

    pub(crate) request_timeout_secs: u64,
    pub(crate) max_body_bytes: usize,

    /// Cap on captured sub-requests per page
    pub(crate) max_requests_per_page: usize,

    /// Enqueue external URLs instead of only recording them as edges
    pub(crate) follow_external: bool,

    /// Sort query parameters during normalization
    pub(crate) normalize_query_order: bool,

    pub(crate) user_agent: String,

    /// Error rate over the sliding window above which the crawl aborts
    pub(crate) max_error_rate: f64,

    /// Completed fetches in the error budget window
    pub(crate) error_window: usize,

    /// Completed pages between checkpoints
    pub(crate) checkpoint_interval: u64,

    /// Resident-set high-water mark; crossing it halves concurrency
    pub(crate) memory_high_water_bytes: Option<u64>,
    /// Resident-set low-water mark; dropping below it restores concurrency
    pub(crate) memory_low_water_bytes: Option<u64>,

    pub(crate) robots_fetch_timeout_secs: u64,

    pub(crate) excluded_patterns: Option<Vec<String>>,

    /// Compiled regex patterns from `excluded_patterns`.
    /// Pre-compiled at config creation to avoid hot-path regex compilation.
    #[serde(skip)]
    pub(crate) excluded_patterns_compiled: Vec<regex::Regex>,

    pub(crate) circuit_breaker_enabled: bool,
    pub(crate) circuit_breaker_failure_threshold: u32,
    pub(crate) circuit_breaker_retry_delay_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            out_dir: PathBuf::from("./atlas"),
            mode: FetchMode::Raw,
            max_pages: None,
            max_depth: 3,
            parallel: 8,
            max_per_host: 2,
            host_delay_ms: 500,
            max_retries: 3,
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            max_requests_per_page: 250,
            follow_external: false,
            normalize_query_order: false,
            user_agent: format!("cartographer/{}", env!("CARGO_PKG_VERSION")),
            max_error_rate: 0.5,
            error_window: 100,
            checkpoint_interval: 25,
            memory_high_water_bytes: None,
            memory_low_water_bytes: None,
            robots_fetch_timeout_secs: 30,
            excluded_patterns: None,
            excluded_patterns_compiled: Vec::new(),
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_retry_delay_secs: 300,
        }
    }
}

impl CrawlConfig {
    #[must_use]
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    #[must_use]
    pub fn out_dir(&self) -> &PathBuf {
        &self.out_dir
    }

    #[must_use]
    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    #[must_use]
    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Global concurrency cap, never below 1
    #[must_use]
    pub fn parallel(&self) -> usize {
        self.parallel.max(1)
    }

    #[must_use]
    pub fn max_per_host(&self) -> usize {
        self.max_per_host.max(1)
    }

    #[must_use]
    pub fn host_delay(&self) -> Duration {
        Duration::from_millis(self.host_delay_ms)
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    #[must_use]
    pub fn max_requests_per_page(&self) -> usize {
        self.max_requests_per_page
    }

    #[must_use]
    pub fn follow_external(&self) -> bool {
        self.follow_external
    }

    #[must_use]
    pub fn normalize_query_order(&self) -> bool {
        self.normalize_query_order
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[must_use]
    pub fn max_error_rate(&self) -> f64 {
        self.max_error_rate
    }

    #[must_use]
    pub fn error_window(&self) -> usize {
        self.error_window.max(1)
    }

    #[must_use]
    pub fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval.max(1)
    }

    #[must_use]
    pub fn memory_high_water_bytes(&self) -> Option<u64> {
        self.memory_high_water_bytes
    }

    #[must_use]
    pub fn memory_low_water_bytes(&self) -> Option<u64> {
        self.memory_low_water_bytes
    }

    #[must_use]
    pub fn robots_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.robots_fetch_timeout_secs)
    }

    /// Get the pre-compiled excluded patterns
    #[must_use]
    pub fn excluded_patterns_compiled(&self) -> &[regex::Regex] {
        &self.excluded_patterns_compiled
    }

    #[must_use]
    pub fn circuit_breaker_enabled(&self) -> bool {
        self.circuit_breaker_enabled
    }

    #[must_use]
    pub fn circuit_breaker_failure_threshold(&self) -> u32 {
        self.circuit_breaker_failure_threshold
    }

    #[must_use]
    pub fn circuit_breaker_retry_delay_secs(&self) -> u64 {
        self.circuit_breaker_retry_delay_secs
    }

    /// Stable fingerprint of every crawl-relevant setting
    ///
    /// A checkpoint written under one fingerprint refuses to resume under
    /// another, so two archives with the same fingerprint were produced by
    /// equivalent configurations.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        // Serde skips the compiled regexes, so the fingerprint covers
        // exactly the declarative fields.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&canonical))
    }
}
