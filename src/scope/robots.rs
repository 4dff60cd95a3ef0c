//! Per-host robots.txt admission
//!
//! robots.txt is fetched lazily the first time a host is seen and cached
//! for the lifetime of the crawl. The cache entry is initialized exactly
//! once per host behind an async once-cell, so concurrent tasks hitting a
//! new host trigger a single fetch. A fetch failure (timeout, network,
//! non-2xx) defaults to *allow*.

use dashmap::DashMap;
use log::{debug, warn};
use robotstxt::DefaultMatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

/// Admission decision for one URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobotsVerdict {
    pub allowed: bool,
    /// `Crawl-delay` for the configured user agent, when declared
    pub crawl_delay: Option<Duration>,
}

/// Cached robots.txt state for one host
#[derive(Debug, Clone)]
struct HostRobots {
    /// Raw robots.txt body; `None` means the fetch failed (allow all)
    content: Option<String>,
    crawl_delay: Option<Duration>,
}

impl HostRobots {
    fn allow_all() -> Self {
        Self {
            content: None,
            crawl_delay: None,
        }
    }

    fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        match &self.content {
            Some(content) if !content.is_empty() => {
                DefaultMatcher::default().one_agent_allowed_by_robots(content, user_agent, url)
            }
            _ => true,
        }
    }
}

/// Crawl-lifetime robots.txt cache, one entry per host
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    hosts: DashMap<String, Arc<OnceCell<HostRobots>>>,
}

impl RobotsCache {
    /// Create a cache with its own HTTP client
    ///
    /// # Arguments
    /// * `user_agent` - Agent string checked against robots rules
    /// * `fetch_timeout` - Budget for each robots.txt fetch
    pub fn new(user_agent: &str, fetch_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(fetch_timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            hosts: DashMap::new(),
        })
    }

    /// Check whether a URL is admitted by its host's robots.txt
    pub async fn check(&self, url: &Url) -> RobotsVerdict {
        let Some(host) = url.host_str() else {
            return RobotsVerdict {
                allowed: true,
                crawl_delay: None,
            };
        };
        let authority = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };

        let cell = self
            .hosts
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let robots = cell
            .get_or_init(|| self.fetch_host_robots(authority))
            .await;

        RobotsVerdict {
            allowed: robots.is_allowed(url.as_str(), &self.user_agent),
            crawl_delay: robots.crawl_delay,
        }
    }

    async fn fetch_host_robots(&self, authority: String) -> HostRobots {
        let robots_url = format!("{authority}/robots.txt");
        debug!("Fetching robots policy: {robots_url}");

        let response = match self.client.get(&robots_url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("robots.txt fetch failed for {authority}, defaulting to allow: {e}");
                return HostRobots::allow_all();
            }
        };

        if !response.status().is_success() {
            debug!(
                "robots.txt returned {} for {authority}, defaulting to allow",
                response.status()
            );
            return HostRobots::allow_all();
        }

        match response.text().await {
            Ok(body) => {
                let crawl_delay = parse_crawl_delay(&body, &self.user_agent);
                HostRobots {
                    content: Some(body),
                    crawl_delay,
                }
            }
            Err(e) => {
                warn!("robots.txt body read failed for {authority}, defaulting to allow: {e}");
                HostRobots::allow_all()
            }
        }
    }
}

/// Extract `Crawl-delay` for a user agent from a robots.txt body
///
/// The robotstxt matcher does not surface crawl-delay, so the group scan
/// lives here. A group addressing the agent by name wins over the `*`
/// group.
fn parse_crawl_delay(body: &str, user_agent: &str) -> Option<Duration> {
    let agent_lower = user_agent.to_lowercase();
    let mut group_agents: Vec<String> = Vec::new();
    let mut in_group_header = true;
    let mut wildcard_delay: Option<Duration> = None;
    let mut specific_delay: Option<Duration> = None;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                if !in_group_header {
                    group_agents.clear();
                }
                in_group_header = true;
                group_agents.push(value.to_lowercase());
            }
            "crawl-delay" => {
                in_group_header = false;
                let Ok(secs) = value.parse::<f64>() else {
                    continue;
                };
                // A day is already an absurd crawl delay; anything out of
                // range is treated as absent.
                if !(0.0..=86_400.0).contains(&secs) {
                    continue;
                }
                let delay = Duration::from_secs_f64(secs);
                for agent in &group_agents {
                    if agent == "*" {
                        wildcard_delay.get_or_insert(delay);
                    } else if agent_lower.contains(agent.as_str()) {
                        specific_delay.get_or_insert(delay);
                    }
                }
            }
            _ => {
                in_group_header = false;
            }
        }
    }

    specific_delay.or(wildcard_delay)
}
