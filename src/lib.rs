//! Cartographer: a web crawling and archival engine
//!
//! Traverses a set of seed URLs, renders pages (optionally through a
//! headless browser), extracts structured facts (links, assets, SEO
//! metadata), and writes the results to a self-describing, compressed,
//! integrity-hashed archive called an Atlas. Archives are replayable and
//! analyzable without re-crawling, and interrupted crawls resume from a
//! durable checkpoint.

pub mod atlas;
pub mod checkpoint;
pub mod config;
pub mod crawl_engine;
pub mod events;
pub mod extract;
pub mod fetch;
pub mod scope;

use std::sync::Arc;

pub use atlas::{AtlasManifest, AtlasReader, AtlasWriter};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{CrawlConfig, FetchMode};
pub use crawl_engine::{CancelHandle, CrawlError, CrawlSummary, Scheduler, SchedulerState};
pub use events::{CrawlEvent, CrawlEventBus};

use fetch::{BrowserFetcher, RawFetcher};

/// Per-invocation options that are not part of the config fingerprint
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOptions {
    /// Resume from the checkpoint in the output directory
    pub resume: bool,
}

/// Run a crawl with a private event bus and no external cancellation
pub async fn crawl(config: CrawlConfig, options: CrawlOptions) -> Result<CrawlSummary, CrawlError> {
    crawl_with(
        config,
        options,
        Arc::new(CrawlEventBus::new()),
        CancelHandle::new(),
    )
    .await
}

/// Run a crawl, publishing lifecycle events to `events` and honoring
/// `cancel`
///
/// Dispatches on the configured fetch mode: raw crawls use a plain HTTP
/// client, prerender and full crawls launch a headless browser that is
/// closed when the crawl stops.
pub async fn crawl_with(
    config: CrawlConfig,
    options: CrawlOptions,
    events: Arc<CrawlEventBus>,
    cancel: CancelHandle,
) -> Result<CrawlSummary, CrawlError> {
    match config.mode() {
        FetchMode::Raw => {
            let fetcher = Arc::new(
                RawFetcher::new(&config).map_err(|e| CrawlError::Config(e.to_string()))?,
            );
            let scheduler = Scheduler::new(config, fetcher, events, cancel)?;
            scheduler.run(options.resume).await
        }
        FetchMode::Prerender | FetchMode::Full => {
            let fetcher = Arc::new(
                BrowserFetcher::launch(&config)
                    .await
                    .map_err(|e| CrawlError::Browser(e.to_string()))?,
            );
            let scheduler = Scheduler::new(config, Arc::clone(&fetcher), events, cancel)?;
            let result = scheduler.run(options.resume).await;
            match Arc::try_unwrap(fetcher) {
                Ok(fetcher) => fetcher.close().await,
                Err(_) => log::warn!("Browser fetcher still referenced after crawl, leaking"),
            }
            result
        }
    }
}
