//! Coordinator: single serialized owner of mutable crawl state
//!
//! The frontier, the per-host limiter, the counters, and the page id
//! sequence all live behind one async mutex. Tasks never hold references
//! into this state; they call operations that lock, mutate, and release.
//! Checkpoints quiesce the crawl simply by holding the lock while the
//! snapshot is captured: no lease and no completion can interleave.

use std::time::Instant;
use tokio::sync::Mutex;

use crate::atlas::records::{CrawlCounters, ErrorKind};

use super::frontier::{
    Frontier, FrontierSnapshot, LeaseDecision, Outcome, UrlRecord, UrlState,
};
use super::host_limiter::HostLimiter;

/// State guarded by the coordinator lock
struct CoordinatorState {
    frontier: Frontier,
    limiter: HostLimiter,
    counters: CrawlCounters,
    page_seq: u64,
}

/// Consistent snapshot handed to the checkpoint manager
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub frontier: FrontierSnapshot,
    pub counters: CrawlCounters,
    pub page_seq: u64,
    pub host_order: Vec<String>,
}

/// Serialized facade over frontier + limiter + counters
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    #[must_use]
    pub fn new(limiter: HostLimiter) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                frontier: Frontier::new(),
                limiter,
                counters: CrawlCounters::default(),
                page_seq: 0,
            }),
        }
    }

    /// Add discovered URLs to the frontier (no-ops for seen URLs)
    pub async fn add_urls(&self, records: Vec<UrlRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.frontier.add(record);
        }
    }

    /// Record a redirect target as already archived
    pub async fn absorb_redirect(&self, record: UrlRecord) {
        self.state.lock().await.frontier.absorb_redirect(record);
    }

    /// Record the robots crawl-delay learned for a host
    pub async fn set_crawl_delay(&self, host: &str, delay: Option<std::time::Duration>) {
        self.state.lock().await.limiter.set_crawl_delay(host, delay);
    }

    /// Try to lease the next entry, honoring per-host limits
    ///
    /// On success the host slot is acquired and the entry is in-flight;
    /// the caller owes a matching [`Coordinator::complete`].
    pub async fn try_lease(&self) -> LeaseDecision {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        // Split borrow: the closure reads the limiter while the frontier
        // is scanned mutably.
        let CoordinatorState {
            frontier, limiter, ..
        } = &mut *state;
        let decision = frontier.lease(now, |host| limiter.eligibility(host, now));
        if let LeaseDecision::Leased { record, .. } = &decision {
            limiter.acquire(&record.host, now);
        }
        decision
    }

    /// Report the outcome of a leased entry and release its host slot
    ///
    /// Returns the terminal frontier state, or the invariant-violation
    /// message when the URL was not in-flight.
    pub async fn complete(&self, url: &str, host: &str, outcome: Outcome) -> Result<UrlState, String> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.limiter.release(host, now);
        state.frontier.complete(url, outcome)
    }

    /// Mark a pending URL skipped
    pub async fn skip(&self, url: &str) {
        self.state.lock().await.frontier.skip(url);
    }

    /// Claim a page slot and allocate its id (`p`-prefixed, zero padded)
    ///
    /// Returns `None` once `max_pages` slots have been claimed; the
    /// claim is atomic with the id sequence, so the archive can never
    /// hold more than `max_pages` page rows.
    pub async fn claim_page(&self, max_pages: Option<usize>) -> Option<String> {
        let mut state = self.state.lock().await;
        if let Some(max) = max_pages
            && state.page_seq >= max as u64
        {
            return None;
        }
        state.page_seq += 1;
        Some(format!("p{:08}", state.page_seq))
    }

    /// Count a finished page
    pub async fn record_page_done(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.counters.pages_done += 1;
        state.counters.pages_done
    }

    /// Count an error by kind
    pub async fn record_error(&self, kind: ErrorKind) {
        self.state.lock().await.counters.record_error(kind);
    }

    /// Track bytes accepted by the archive writer
    pub async fn record_bytes_written(&self, bytes: u64) {
        self.state.lock().await.counters.bytes_written += bytes;
    }

    #[must_use]
    pub async fn counters(&self) -> CrawlCounters {
        self.state.lock().await.counters.clone()
    }

    #[must_use]
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.frontier.pending_count()
    }

    #[must_use]
    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.frontier.in_flight_count()
    }

    /// True when nothing is pending or in-flight
    #[must_use]
    pub async fn is_drained(&self) -> bool {
        self.state.lock().await.frontier.is_drained()
    }

    #[must_use]
    pub async fn url_state(&self, url: &str) -> Option<UrlState> {
        self.state.lock().await.frontier.state_of(url)
    }

    #[must_use]
    pub async fn pages_done(&self) -> u64 {
        self.state.lock().await.counters.pages_done
    }

    /// Capture a consistent snapshot under the lock
    ///
    /// While this future holds the lock, no lease and no completion can
    /// happen, which is exactly the quiescence the checkpoint protocol
    /// requires.
    #[must_use]
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock().await;
        CoordinatorSnapshot {
            frontier: state.frontier.snapshot(),
            counters: state.counters.clone(),
            page_seq: state.page_seq,
            host_order: state.limiter.host_order(),
        }
    }

    /// Restore frontier, counters, and round-robin position from a
    /// checkpoint snapshot
    pub async fn restore(&self, snapshot: CoordinatorSnapshot) {
        let mut state = self.state.lock().await;
        state.frontier.restore(snapshot.frontier);
        state.counters = snapshot.counters;
        state.page_seq = snapshot.page_seq;
        state.limiter.restore_host_order(&snapshot.host_order);
    }
}
