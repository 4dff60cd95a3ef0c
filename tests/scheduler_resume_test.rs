//! Scheduler behavior under retries, cancellation, resume, and the error
//! budget, driven by a scripted fetcher over a synthetic site.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use cartographer::atlas::AtlasReader;
use cartographer::crawl_engine::{CancelHandle, CrawlError, Scheduler};
use cartographer::events::{CrawlEvent, CrawlEventBus};
use cartographer::fetch::{
    FetchFailure, FetchTiming, FetchedPage, Fetcher, classify_challenge,
};
use cartographer::{CrawlConfig, CrawlSummary};

/// Serves a fixed URL → HTML map; unknown URLs are 404, and URLs listed
/// in `fail_once` respond 500 exactly once.
struct SiteFetcher {
    pages: HashMap<String, String>,
    fail_once: Mutex<HashSet<String>>,
}

impl SiteFetcher {
    fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages,
            fail_once: Mutex::new(HashSet::new()),
        }
    }

    fn fail_once(self, url: &str) -> Self {
        self.fail_once.lock().unwrap().insert(url.to_string());
        self
    }
}

impl Fetcher for SiteFetcher {
    fn fetch(
        &self,
        url: &str,
        _attempt: u32,
    ) -> impl Future<Output = Result<FetchedPage, FetchFailure>> + Send {
        let result = if self.fail_once.lock().unwrap().remove(url) {
            Err(FetchFailure::http_status(500, format!("HTTP 500 for {url}")))
        } else {
            match self.pages.get(url) {
                Some(html) => {
                    let headers = BTreeMap::new();
                    let challenge = classify_challenge(200, &headers, html);
                    Ok(FetchedPage {
                        final_url: url.to_string(),
                        status: 200,
                        headers,
                        body: html.clone(),
                        network_log: Vec::new(),
                        timing: FetchTiming::started_now(),
                        challenge,
                        audits: None,
                    })
                }
                None => Err(FetchFailure::http_status(404, format!("HTTP 404 for {url}"))),
            }
        };
        async move { result }
    }
}

/// A chain site: /p0 → /p1 → … → /p{n-1}, robots served by mockito so
/// admission checks stay local.
fn chain_site(base: &str, n: usize) -> HashMap<String, String> {
    let mut pages = HashMap::new();
    for i in 0..n {
        let body = if i + 1 < n {
            format!(r#"<html><body><a href="{base}/p{}">next</a></body></html>"#, i + 1)
        } else {
            "<html><body>the end</body></html>".to_string()
        };
        pages.insert(format!("{base}/p{i}"), body);
    }
    pages
}

fn chain_config(base: &str, out: &TempDir) -> CrawlConfig {
    CrawlConfig::builder()
        .out_dir(out.path())
        .host_delay_ms(0)
        .parallel(2)
        .max_depth(50)
        .max_retries(1)
        .seeds([format!("{base}/p0")])
        .build()
        .expect("config")
}

async fn run_crawl(
    config: CrawlConfig,
    fetcher: Arc<SiteFetcher>,
    events: Arc<CrawlEventBus>,
    cancel: CancelHandle,
    resume: bool,
) -> Result<CrawlSummary, CrawlError> {
    let scheduler = Scheduler::new(config, fetcher, events, cancel).expect("scheduler");
    scheduler.run(resume).await
}

#[tokio::test]
async fn transient_failure_is_retried_and_recorded() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let out = TempDir::new().expect("out dir");
    let fetcher = Arc::new(SiteFetcher::new(chain_site(&base, 1)).fail_once(&format!("{base}/p0")));

    let summary = run_crawl(
        chain_config(&base, &out),
        fetcher,
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
        false,
    )
    .await
    .expect("crawl succeeds after retry");

    assert_eq!(summary.counters.pages_done, 1);
    assert_eq!(summary.counters.errors_total, 1);

    let reader = AtlasReader::open(out.path()).expect("open archive");
    let errors = reader.read_part_records("errors").expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["kind"], "httpStatus");
    assert_eq!(errors[0]["attempt"], 1);
    assert_eq!(reader.read_part_records("pages").expect("pages").len(), 1);
}

#[tokio::test]
async fn cancel_then_resume_produces_complete_deduplicated_archive() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let out = TempDir::new().expect("out dir");
    let pages = chain_site(&base, 10);

    // First run: cancel once three pages are done.
    let events = Arc::new(CrawlEventBus::new());
    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        events.subscribe(move |event| {
            if let CrawlEvent::Progress { counters, .. } = event
                && counters.pages_done >= 3
            {
                cancel.cancel();
            }
        });
    }
    let result = run_crawl(
        chain_config(&base, &out),
        Arc::new(SiteFetcher::new(pages.clone())),
        events,
        cancel,
        false,
    )
    .await;
    assert!(matches!(result, Err(CrawlError::Cancelled)));
    assert!(
        out.path().join("checkpoint.json").exists(),
        "interrupted run leaves its checkpoint"
    );
    assert!(
        !out.path().join("manifest.json").exists(),
        "interrupted archive has no manifest"
    );

    // Second run resumes and finishes the chain.
    let summary = run_crawl(
        chain_config(&base, &out),
        Arc::new(SiteFetcher::new(pages)),
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
        true,
    )
    .await
    .expect("resumed crawl completes");
    assert_eq!(summary.counters.pages_done, 10);

    let reader = AtlasReader::open(out.path()).expect("open archive");
    reader.verify().expect("audit hash verifies");

    let rows = reader.read_part_records("pages").expect("pages");
    let urls: HashSet<&str> = rows.iter().map(|r| r["url"].as_str().unwrap()).collect();
    assert_eq!(rows.len(), 10, "no duplicate page records after resume");
    let expected: HashSet<String> = (0..10).map(|i| format!("{base}/p{i}")).collect();
    assert_eq!(
        urls,
        expected.iter().map(String::as_str).collect::<HashSet<_>>()
    );

    assert!(
        !out.path().join("checkpoint.json").exists(),
        "completed archive drops its checkpoint"
    );
}

#[tokio::test]
async fn resume_with_changed_config_is_refused() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let out = TempDir::new().expect("out dir");
    let pages = chain_site(&base, 5);

    let events = Arc::new(CrawlEventBus::new());
    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        events.subscribe(move |event| {
            if let CrawlEvent::Progress { counters, .. } = event
                && counters.pages_done >= 1
            {
                cancel.cancel();
            }
        });
    }
    let result = run_crawl(
        chain_config(&base, &out),
        Arc::new(SiteFetcher::new(pages.clone())),
        events,
        cancel,
        false,
    )
    .await;
    assert!(matches!(result, Err(CrawlError::Cancelled)));

    // Same archive, different max_depth: the fingerprint no longer
    // matches the checkpoint.
    let changed = CrawlConfig::builder()
        .out_dir(out.path())
        .host_delay_ms(0)
        .max_depth(2)
        .seeds([format!("{base}/p0")])
        .build()
        .expect("config");
    let result = run_crawl(
        changed,
        Arc::new(SiteFetcher::new(pages)),
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
        true,
    )
    .await;
    match result {
        Err(e @ CrawlError::Checkpoint(_)) => assert_eq!(e.exit_code(), 2),
        other => panic!("expected checkpoint error, got {other:?}"),
    }
}

#[tokio::test]
async fn error_budget_trips_and_halts_leasing() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let out = TempDir::new().expect("out dir");
    // Every seed 404s; window of 4 at a 0.5 threshold trips on the
    // fourth completion.
    let seeds: Vec<String> = (0..6).map(|i| format!("{base}/missing{i}")).collect();
    let config = CrawlConfig::builder()
        .out_dir(out.path())
        .host_delay_ms(0)
        .parallel(1)
        .max_retries(0)
        .error_window(4)
        .max_error_rate(0.5)
        .seeds(seeds)
        .build()
        .expect("config");

    let result = run_crawl(
        config,
        Arc::new(SiteFetcher::new(HashMap::new())),
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
        false,
    )
    .await;

    match result {
        Err(e @ CrawlError::ErrorBudgetExceeded) => assert_eq!(e.exit_code(), 4),
        other => panic!("expected budget trip, got {other:?}"),
    }
    assert!(
        out.path().join("checkpoint.json").exists(),
        "budget trip writes a final checkpoint"
    );
    assert!(
        !out.path().join("manifest.json").exists(),
        "aborted archive has no manifest"
    );
}

#[tokio::test]
async fn shared_target_is_fetched_once() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let out = TempDir::new().expect("out dir");
    let mut pages = HashMap::new();
    pages.insert(
        format!("{base}/a"),
        format!(r#"<a href="{base}/shared">s</a>"#),
    );
    pages.insert(
        format!("{base}/b"),
        format!(r#"<a href="{base}/shared">s</a>"#),
    );
    pages.insert(format!("{base}/shared"), "<html>shared</html>".to_string());

    let config = CrawlConfig::builder()
        .out_dir(out.path())
        .host_delay_ms(0)
        .seeds([format!("{base}/a"), format!("{base}/b")])
        .build()
        .expect("config");

    let summary = run_crawl(
        config,
        Arc::new(SiteFetcher::new(pages)),
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
        false,
    )
    .await
    .expect("crawl");

    assert_eq!(summary.counters.pages_done, 3);
    let reader = AtlasReader::open(out.path()).expect("open archive");
    assert_eq!(reader.read_part_records("pages").expect("pages").len(), 3);
    assert_eq!(reader.read_part_records("edges").expect("edges").len(), 2);
}
