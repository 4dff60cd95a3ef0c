//! Browser-backed fetch modes (prerender and full)
//!
//! Drives a headless Chromium over CDP. Prerender navigates, waits for
//! the network to go quiet, and serializes the DOM; full mode adds
//! post-load performance and accessibility probes evaluated in the page.
//! The adapter enforces the per-request timeout, the body cap, and the
//! sub-request cap even when the page would otherwise hang.

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};

use crate::atlas::records::{ErrorKind, ErrorPhase};
use crate::config::{CrawlConfig, FetchMode};

use super::{
    FetchFailure, FetchTiming, FetchedPage, Fetcher, NetworkEntry, PageAudits,
    challenge::classify_challenge,
};

/// Quiet period that counts as network idle
const NETWORK_IDLE_QUIET: Duration = Duration::from_millis(500);

/// Upper bound on the idle wait, hung pages included
const NETWORK_IDLE_MAX_WAIT: Duration = Duration::from_secs(15);

/// Performance probe evaluated post-load in full mode
const PERFORMANCE_SCRIPT: &str = r#"
(() => {
    const nav = performance.getEntriesByType('navigation')[0];
    const paint = {};
    for (const entry of performance.getEntriesByType('paint')) {
        paint[entry.name] = entry.startTime;
    }
    return JSON.parse(JSON.stringify({
        domContentLoaded: nav ? nav.domContentLoadedEventEnd : null,
        loadEvent: nav ? nav.loadEventEnd : null,
        transferSize: nav ? nav.transferSize : null,
        resourceCount: performance.getEntriesByType('resource').length,
        paint,
    }));
})()
"#;

/// Accessibility probe evaluated post-load in full mode
const ACCESSIBILITY_SCRIPT: &str = r#"
(() => {
    const imagesMissingAlt = document.querySelectorAll('img:not([alt])').length;
    const inputsMissingLabel = [...document.querySelectorAll('input:not([type=hidden])')]
        .filter(el => !el.labels || el.labels.length === 0)
        .filter(el => !el.getAttribute('aria-label') && !el.getAttribute('aria-labelledby'))
        .length;
    const headings = [...document.querySelectorAll('h1,h2,h3,h4,h5,h6')].map(h => h.tagName);
    return {
        imagesMissingAlt,
        inputsMissingLabel,
        documentLanguage: document.documentElement.getAttribute('lang'),
        headingOutline: headings,
        landmarkCount: document.querySelectorAll('main,nav,header,footer,aside').length,
    };
})()
"#;

/// Find a Chrome/Chromium executable on this machine
///
/// `CHROMIUM_PATH` overrides the search; otherwise common install paths
/// are probed, then `which`.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
        ]
    };
    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            debug!("Found browser at {}", path.display());
            return Ok(path);
        }
    }

    for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
        if let Ok(output) = Command::new("which").arg(cmd).output()
            && output.status.success()
        {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    Err(anyhow::anyhow!("no Chrome/Chromium executable found"))
}

/// Headless-browser fetcher implementing prerender and full modes
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
    mode: FetchMode,
    request_timeout: Duration,
    max_body_bytes: usize,
    max_sub_requests: usize,
}

impl BrowserFetcher {
    /// Launch a browser configured for the given crawl
    pub async fn launch(config: &CrawlConfig) -> Result<Self> {
        let chrome_path = find_browser_executable().await?;
        let user_data_dir =
            std::env::temp_dir().join(format!("cartographer_chrome_{}", std::process::id()));
        std::fs::create_dir_all(&user_data_dir).context("Failed to create user data directory")?;

        let browser_config = BrowserConfigBuilder::default()
            .request_timeout(config.request_timeout())
            .window_size(1920, 1080)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path)
            .headless_mode(HeadlessMode::default())
            .arg(format!("--user-agent={}", config.user_agent()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-background-networking")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--metrics-recording-only")
            .arg("--mute-audio")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        let handler_task = task::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let msg = e.to_string();
                    // Chrome emits CDP events chromiumoxide cannot decode;
                    // those are not actionable.
                    if msg.contains("data did not match any variant of untagged enum Message") {
                        trace!("Suppressed benign CDP decode error: {msg}");
                    } else {
                        error!("Browser handler error: {e:?}");
                    }
                }
            }
            debug!("Browser handler task completed");
        });

        Ok(Self {
            browser: Arc::new(browser),
            handler_task,
            user_data_dir,
            mode: config.mode(),
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_body_bytes(),
            max_sub_requests: config.max_requests_per_page(),
        })
    }

    async fn fetch_inner(&self, url: &str, attempt: u32) -> Result<FetchedPage, FetchFailure> {
        let mut timing = FetchTiming::started_now();
        debug!("Rendering {url} (mode {}, attempt {attempt})", self.mode);

        let render_err =
            |msg: String| FetchFailure::new(ErrorKind::RenderFailure, ErrorPhase::Render, msg);

        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| render_err(format!("failed to open page: {e}")))?;

        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| render_err(format!("failed to attach network listener: {e}")))?;

        // Shared with the collector task; the page drives both.
        let network_log: Arc<Mutex<Vec<NetworkEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let main_response: Arc<Mutex<Option<(String, u16, BTreeMap<String, String>)>>> =
            Arc::new(Mutex::new(None));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let collector = {
            let network_log = Arc::clone(&network_log);
            let main_response = Arc::clone(&main_response);
            let last_activity = Arc::clone(&last_activity);
            let cap = self.max_sub_requests;
            task::spawn(async move {
                while let Some(event) = events.next().await {
                    if let Ok(mut at) = last_activity.lock() {
                        *at = Instant::now();
                    }
                    let status = u16::try_from(event.response.status).ok();
                    if event.r#type == ResourceType::Document {
                        let headers = headers_from_cdp(&event.response.headers);
                        if let Ok(mut main) = main_response.lock()
                            && main.is_none()
                        {
                            *main = Some((
                                event.response.url.clone(),
                                status.unwrap_or(0),
                                headers,
                            ));
                        }
                    }
                    if let Ok(mut log) = network_log.lock()
                        && log.len() < cap
                    {
                        log.push(NetworkEntry {
                            url: event.response.url.clone(),
                            resource_type: format!("{:?}", event.r#type).to_lowercase(),
                            status,
                            bytes: u64::try_from(event.response.encoded_data_length as i64).ok(),
                        });
                    }
                }
            })
        };

        let navigation = async {
            page.goto(url)
                .await
                .map_err(|e| render_err(format!("navigation failed: {e}")))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| render_err(format!("page load failed: {e}")))?;
            Ok::<(), FetchFailure>(())
        };
        match tokio::time::timeout(self.request_timeout, navigation).await {
            Ok(result) => {
                if let Err(e) = result {
                    collector.abort();
                    let _ = page.close().await;
                    return Err(e);
                }
            }
            Err(_) => {
                collector.abort();
                let _ = page.close().await;
                return Err(FetchFailure::new(
                    ErrorKind::Timeout,
                    ErrorPhase::Render,
                    format!("navigation timeout after {:?} for {url}", self.request_timeout),
                ));
            }
        }
        timing.response_at = Some(Utc::now());

        self.wait_for_network_idle(&last_activity).await;
        timing.render_complete_at = Some(Utc::now());

        let html = match tokio::time::timeout(self.request_timeout, page.content()).await {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => {
                collector.abort();
                let _ = page.close().await;
                return Err(render_err(format!("DOM serialization failed: {e}")));
            }
            Err(_) => {
                collector.abort();
                let _ = page.close().await;
                return Err(FetchFailure::new(
                    ErrorKind::Timeout,
                    ErrorPhase::Render,
                    format!("DOM serialization timeout for {url}"),
                ));
            }
        };
        if html.len() > self.max_body_bytes {
            collector.abort();
            let _ = page.close().await;
            return Err(FetchFailure::new(
                ErrorKind::BodyTooLarge,
                ErrorPhase::Render,
                format!("rendered DOM exceeded {} byte cap at {url}", self.max_body_bytes),
            ));
        }

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let audits = if self.mode == FetchMode::Full {
            self.collect_audits(&page).await
        } else {
            None
        };

        collector.abort();
        if let Err(e) = page.close().await {
            warn!("Failed to close page for {url}: {e}");
        }

        let (status, headers) = {
            let main = main_response.lock().ok().and_then(|m| m.clone());
            match main {
                Some((_, status, headers)) if status != 0 => (status, headers),
                _ => (200, BTreeMap::new()),
            }
        };
        let network_log = network_log.lock().map(|l| l.clone()).unwrap_or_default();

        let challenge = classify_challenge(status, &headers, &html);
        if challenge.is_none() && !(200..300).contains(&status) {
            return Err(FetchFailure::http_status(
                status,
                format!("HTTP {status} for {url}"),
            ));
        }

        Ok(FetchedPage {
            final_url,
            status,
            headers,
            body: html,
            network_log,
            timing,
            challenge,
            audits,
        })
    }

    /// Wait until no network event has arrived for the quiet period, or
    /// the max wait elapses.
    async fn wait_for_network_idle(&self, last_activity: &Arc<Mutex<Instant>>) {
        let started = Instant::now();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let idle_for = last_activity
                .lock()
                .map(|at| at.elapsed())
                .unwrap_or(NETWORK_IDLE_QUIET);
            if idle_for >= NETWORK_IDLE_QUIET || started.elapsed() >= NETWORK_IDLE_MAX_WAIT {
                break;
            }
        }
    }

    /// Run the full-mode probes; probe failures degrade to `None` fields
    /// rather than failing the page.
    async fn collect_audits(&self, page: &chromiumoxide::Page) -> Option<PageAudits> {
        let performance = match page.evaluate(PERFORMANCE_SCRIPT).await {
            Ok(result) => result.into_value().unwrap_or(serde_json::Value::Null),
            Err(e) => {
                warn!("Performance probe failed: {e}");
                serde_json::Value::Null
            }
        };
        let accessibility = match page.evaluate(ACCESSIBILITY_SCRIPT).await {
            Ok(result) => result.into_value().unwrap_or(serde_json::Value::Null),
            Err(e) => {
                warn!("Accessibility probe failed: {e}");
                serde_json::Value::Null
            }
        };
        Some(PageAudits {
            performance,
            accessibility,
        })
    }

    /// Close the browser and reap its process
    pub async fn close(self) {
        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    warn!("Failed to close browser: {e}");
                }
                if let Err(e) = browser.wait().await {
                    warn!("Failed to wait for browser exit: {e}");
                }
            }
            Err(arc) => {
                warn!(
                    "Browser still has {} strong references, close deferred to drop",
                    Arc::strong_count(&arc)
                );
            }
        }
        self.handler_task.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!("Could not remove browser profile dir: {e}");
        }
    }
}

impl Fetcher for BrowserFetcher {
    fn fetch(
        &self,
        url: &str,
        attempt: u32,
    ) -> impl std::future::Future<Output = Result<FetchedPage, FetchFailure>> + Send {
        self.fetch_inner(url, attempt)
    }
}

/// Flatten CDP headers into a lowercase string map
fn headers_from_cdp(headers: &chromiumoxide::cdp::browser_protocol::network::Headers) -> BTreeMap<String, String> {
    headers
        .inner()
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    (
                        k.to_lowercase(),
                        v.as_str().map(ToString::to_string).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}
