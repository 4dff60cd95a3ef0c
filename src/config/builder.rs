//! Type-safe builder for `CrawlConfig` using the typestate pattern
//!
//! The builder requires seeds and an output directory before `build()`
//! becomes available; everything else has validated defaults.

use anyhow::{Result, anyhow};
use regex::Regex;
use std::marker::PhantomData;
use std::path::PathBuf;

use super::types::{CrawlConfig, FetchMode};

/// Compile a glob pattern into a regex
///
/// Converts glob patterns (where * matches any sequence) into proper regex
/// patterns, anchored to the full URL. Done once at config creation time.
///
/// # Errors
///
/// Returns an error if the resulting regex pattern is invalid.
fn compile_glob_pattern(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    let anchored = format!("^{escaped}$");
    Regex::new(&anchored).map_err(|e| anyhow!("Invalid glob pattern '{pattern}': {e}"))
}

// Type states for the builder
pub struct WithOutDir;
pub struct WithSeeds;

pub struct CrawlConfigBuilder<State = ()> {
    pub(crate) inner: CrawlConfig,
    pub(crate) _phantom: PhantomData<State>,
}

impl CrawlConfig {
    /// Create a builder for configuring a `CrawlConfig` with a fluent interface
    #[must_use]
    pub fn builder() -> CrawlConfigBuilder<()> {
        CrawlConfigBuilder {
            inner: CrawlConfig::default(),
            _phantom: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<()> {
    pub fn out_dir(self, dir: impl Into<PathBuf>) -> CrawlConfigBuilder<WithOutDir> {
        let mut inner = self.inner;
        inner.out_dir = dir.into();
        CrawlConfigBuilder {
            inner,
            _phantom: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<WithOutDir> {
    pub fn seeds<I, S>(self, seeds: I) -> CrawlConfigBuilder<WithSeeds>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner;
        inner.seeds = seeds
            .into_iter()
            .map(|s| {
                let url = s.into();
                // Bare hostnames are accepted on the command line
                if url.starts_with("http://") || url.starts_with("https://") {
                    url
                } else {
                    format!("https://{url}")
                }
            })
            .collect();
        CrawlConfigBuilder {
            inner,
            _phantom: PhantomData,
        }
    }
}

// Build method only available when both required fields are set
impl CrawlConfigBuilder<WithSeeds> {
    pub fn build(self) -> Result<CrawlConfig> {
        let mut config = self.inner;

        if config.seeds.is_empty() {
            return Err(anyhow!("at least one seed URL is required"));
        }
        for seed in &config.seeds {
            let parsed = url::Url::parse(seed)
                .map_err(|e| anyhow!("invalid seed URL '{seed}': {e}"))?;
            if parsed.host_str().is_none() {
                return Err(anyhow!("seed URL '{seed}' has no host"));
            }
        }

        if !(0.0..=1.0).contains(&config.max_error_rate) {
            return Err(anyhow!(
                "error budget must be within [0.0, 1.0], got {}",
                config.max_error_rate
            ));
        }

        if let (Some(high), Some(low)) = (
            config.memory_high_water_bytes,
            config.memory_low_water_bytes,
        ) && low >= high
        {
            return Err(anyhow!(
                "memory low-water mark ({low}) must be below the high-water mark ({high})"
            ));
        }

        // Compile excluded patterns once at config creation
        config.excluded_patterns_compiled = if let Some(ref patterns) = config.excluded_patterns {
            patterns
                .iter()
                .map(|p| compile_glob_pattern(p))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        // Absolute out_dir so path operations agree across writer,
        // checkpoint, and manifest.
        if config.out_dir.is_relative() {
            let cwd = std::env::current_dir()
                .map_err(|e| anyhow!("cannot resolve working directory: {e}"))?;
            config.out_dir = cwd.join(&config.out_dir);
        }

        Ok(config)
    }
}

// Optional settings, available at any builder state
impl<State> CrawlConfigBuilder<State> {
    #[must_use]
    pub fn mode(mut self, mode: FetchMode) -> Self {
        self.inner.mode = mode;
        self
    }

    #[must_use]
    pub fn max_pages(mut self, limit: usize) -> Self {
        self.inner.max_pages = Some(limit);
        self
    }

    #[must_use]
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.inner.max_depth = depth;
        self
    }

    #[must_use]
    pub fn parallel(mut self, n: usize) -> Self {
        self.inner.parallel = n.max(1);
        self
    }

    #[must_use]
    pub fn max_per_host(mut self, k: usize) -> Self {
        self.inner.max_per_host = k.max(1);
        self
    }

    #[must_use]
    pub fn host_delay_ms(mut self, millis: u64) -> Self {
        self.inner.host_delay_ms = millis;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.inner.max_retries = retries;
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.inner.request_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.inner.max_body_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_requests_per_page(mut self, count: usize) -> Self {
        self.inner.max_requests_per_page = count;
        self
    }

    #[must_use]
    pub fn follow_external(mut self, follow: bool) -> Self {
        self.inner.follow_external = follow;
        self
    }

    #[must_use]
    pub fn normalize_query_order(mut self, sort: bool) -> Self {
        self.inner.normalize_query_order = sort;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.inner.user_agent = agent.into();
        self
    }

    #[must_use]
    pub fn max_error_rate(mut self, rate: f64) -> Self {
        self.inner.max_error_rate = rate;
        self
    }

    #[must_use]
    pub fn error_window(mut self, window: usize) -> Self {
        self.inner.error_window = window;
        self
    }

    #[must_use]
    pub fn checkpoint_interval(mut self, pages: u64) -> Self {
        self.inner.checkpoint_interval = pages;
        self
    }

    #[must_use]
    pub fn memory_watermarks(mut self, low: u64, high: u64) -> Self {
        self.inner.memory_low_water_bytes = Some(low);
        self.inner.memory_high_water_bytes = Some(high);
        self
    }

    #[must_use]
    pub fn excluded_patterns(mut self, patterns: Vec<String>) -> Self {
        self.inner.excluded_patterns = Some(patterns);
        self
    }

    #[must_use]
    pub fn circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.inner.circuit_breaker_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_valid_seeds() {
        let result = CrawlConfig::builder()
            .out_dir("/tmp/atlas")
            .seeds(["not a url"])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_prepends_scheme() {
        let config = CrawlConfig::builder()
            .out_dir("/tmp/atlas")
            .seeds(["example.com"])
            .build()
            .expect("config should build");
        assert_eq!(config.seeds()[0], "https://example.com");
    }

    #[test]
    fn fingerprint_changes_with_config() {
        let a = CrawlConfig::builder()
            .out_dir("/tmp/atlas")
            .seeds(["https://example.com"])
            .build()
            .expect("config should build");
        let b = CrawlConfig::builder()
            .out_dir("/tmp/atlas")
            .max_depth(7)
            .seeds(["https://example.com"])
            .build()
            .expect("config should build");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    #[test]
    fn glob_patterns_anchor_and_escape() {
        let config = CrawlConfig::builder()
            .out_dir("/tmp/atlas")
            .excluded_patterns(vec!["https://example.com/private/*".to_string()])
            .seeds(["https://example.com"])
            .build()
            .expect("config should build");
        let re = &config.excluded_patterns_compiled()[0];
        assert!(re.is_match("https://example.com/private/a?x=1"));
        assert!(!re.is_match("https://example.com/public/a"));
    }
}
