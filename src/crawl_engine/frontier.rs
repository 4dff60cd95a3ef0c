//! Crawl frontier: the set of known URLs and their scheduling state
//!
//! The frontier owns URL records and deduplicates on the normalized URL.
//! Selection is FIFO within a priority bucket with a host-diversity
//! preference: entries whose host is saturated are skipped but never
//! reordered, so they keep their queue position for the next lease.
//!
//! State transitions are monotonic: pending → in-flight → done | failed,
//! with failed → pending only while the retry policy admits another
//! attempt. Skipped is terminal from any pre-completion state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// How a URL entered the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoverySource {
    Seed,
    Link,
    Redirect,
}

/// Scheduling state of a frontier entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UrlState {
    Pending,
    InFlight,
    Done,
    Failed,
    Skipped,
}

/// A normalized URL with its discovery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlRecord {
    /// Normalized absolute URL (the dedup key)
    pub url: String,
    pub host: String,
    pub scheme: String,
    /// Non-negative crawl depth, seeds are 0
    pub depth: u32,
    pub source: DiscoverySource,
    /// Page id that discovered this URL, absent for seeds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discoverer: Option<String>,
    /// Higher priority leases first
    pub priority: i32,
}

/// One tracked URL with its state and attempt count
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub record: UrlRecord,
    pub state: UrlState,
    pub attempts: u32,
    /// Retry eligibility time; not persisted, a resumed entry is
    /// immediately eligible again.
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

/// Completion outcome reported back by the scheduler
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Done,
    /// Failed; `retry_after` is set when the caller's retry policy admits
    /// another attempt, deferring eligibility by the backoff duration.
    Failed { retry_after: Option<Duration> },
    Skipped,
}

/// Host eligibility answer supplied by the rate limiter during a lease scan
#[derive(Debug, Clone, Copy)]
pub enum HostEligibility {
    /// Host can take the entry; `rank` is its last-served tick, lower
    /// values are served first (round-robin across ready hosts).
    Ready { rank: u64 },
    /// Host is at its concurrency cap; skip without reordering
    Saturated,
    /// Host is inside its politeness delay until the given instant
    DelayedUntil(Instant),
}

/// Result of a lease attempt
#[derive(Debug, Clone)]
pub enum LeaseDecision {
    /// Entry flipped to in-flight; `attempt` is 1-based
    Leased { record: UrlRecord, attempt: u32 },
    /// Nothing leasable right now; retry at the given instant
    Wait(Instant),
    /// Pending entries exist but all their hosts are saturated
    Blocked,
    /// No pending entries at all
    Empty,
}

/// Serializable snapshot of the whole frontier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierSnapshot {
    pub entries: Vec<FrontierEntry>,
}

/// Ordered, deduplicating queue of known URLs
#[derive(Debug, Default)]
pub struct Frontier {
    entries: HashMap<String, FrontierEntry>,
    /// Priority bucket → FIFO of URL keys. Keys may be stale (entry no
    /// longer pending); the lease scan drops them lazily.
    buckets: BTreeMap<i32, VecDeque<String>>,
    pending: usize,
    in_flight: usize,
}

impl Frontier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a URL. No-op for already-seen URLs, except that a strictly
    /// lower incoming depth updates the stored depth without touching
    /// state or queue position.
    pub fn add(&mut self, record: UrlRecord) {
        if let Some(existing) = self.entries.get_mut(&record.url) {
            if record.depth < existing.record.depth {
                existing.record.depth = record.depth;
            }
            return;
        }
        self.buckets
            .entry(record.priority)
            .or_default()
            .push_back(record.url.clone());
        self.pending += 1;
        self.entries.insert(
            record.url.clone(),
            FrontierEntry {
                record,
                state: UrlState::Pending,
                attempts: 0,
                not_before: None,
            },
        );
    }

    /// Record a redirect target that was observed (and archived) under a
    /// page fetched for a different frontier entry. An absent entry is
    /// created directly in the done state; a pending entry is retired as
    /// skipped. Either way the target is never fetched a second time.
    pub fn absorb_redirect(&mut self, record: UrlRecord) {
        match self.entries.get_mut(&record.url) {
            None => {
                self.entries.insert(
                    record.url.clone(),
                    FrontierEntry {
                        record,
                        state: UrlState::Done,
                        attempts: 0,
                        not_before: None,
                    },
                );
            }
            Some(entry) if entry.state == UrlState::Pending => {
                entry.state = UrlState::Skipped;
                self.pending -= 1;
            }
            Some(_) => {}
        }
    }

    /// Lease the next eligible entry, flipping it to in-flight
    ///
    /// Scans priority buckets from highest to lowest, FIFO within each.
    /// `eligibility` answers for each host whether it can take work now;
    /// saturated hosts are skipped without losing queue position. When
    /// several hosts are ready inside the same bucket, the one with the
    /// lowest rank (oldest last-served) wins.
    pub fn lease<E>(&mut self, now: Instant, mut eligibility: E) -> LeaseDecision
    where
        E: FnMut(&str) -> HostEligibility,
    {
        if self.pending == 0 {
            return LeaseDecision::Empty;
        }

        let mut earliest_wait: Option<Instant> = None;
        let mut winner: Option<(i32, usize, u64, String)> = None;

        let priorities: Vec<i32> = self.buckets.keys().rev().copied().collect();
        'buckets: for priority in priorities {
            let Some(queue) = self.buckets.get_mut(&priority) else {
                continue;
            };

            // Drop stale heads eagerly so buckets do not grow unbounded.
            loop {
                let stale = match queue.front() {
                    Some(front) => !matches!(
                        self.entries.get(front),
                        Some(entry) if entry.state == UrlState::Pending
                    ),
                    None => break,
                };
                if stale {
                    queue.pop_front();
                } else {
                    break;
                }
            }
            if queue.is_empty() {
                continue;
            }

            let mut seen_hosts: Vec<String> = Vec::new();
            for (idx, url) in queue.iter().enumerate() {
                let Some(entry) = self.entries.get(url) else {
                    continue;
                };
                if entry.state != UrlState::Pending {
                    continue;
                }
                if let Some(not_before) = entry.not_before
                    && not_before > now
                {
                    earliest_wait = Some(match earliest_wait {
                        Some(t) => t.min(not_before),
                        None => not_before,
                    });
                    continue;
                }
                let host = entry.record.host.clone();
                if seen_hosts.iter().any(|h| *h == host) {
                    continue; // FIFO: only the first entry per host competes
                }
                seen_hosts.push(host.clone());

                match eligibility(&host) {
                    HostEligibility::Ready { rank } => {
                        let better = match &winner {
                            Some((_, _, best_rank, _)) => rank < *best_rank,
                            None => true,
                        };
                        if better {
                            winner = Some((priority, idx, rank, url.clone()));
                        }
                    }
                    HostEligibility::Saturated => {}
                    HostEligibility::DelayedUntil(at) => {
                        earliest_wait = Some(match earliest_wait {
                            Some(t) => t.min(at),
                            None => at,
                        });
                    }
                }
            }

            if winner.is_some() {
                // Lower buckets never outrank a leasable entry here.
                break 'buckets;
            }
        }

        if let Some((priority, idx, _, url)) = winner {
            if let Some(queue) = self.buckets.get_mut(&priority) {
                let _ = queue.remove(idx);
            }
            let entry = match self.entries.get_mut(&url) {
                Some(e) => e,
                None => return LeaseDecision::Empty,
            };
            entry.state = UrlState::InFlight;
            entry.attempts += 1;
            entry.not_before = None;
            self.pending -= 1;
            self.in_flight += 1;
            return LeaseDecision::Leased {
                record: entry.record.clone(),
                attempt: entry.attempts,
            };
        }

        match earliest_wait {
            Some(at) => LeaseDecision::Wait(at),
            None => LeaseDecision::Blocked,
        }
    }

    /// Report the outcome of an in-flight entry
    ///
    /// Returns the entry's terminal state, or an error string when the
    /// URL was not in-flight (an invariant violation the caller treats
    /// as internal).
    pub fn complete(&mut self, url: &str, outcome: Outcome) -> Result<UrlState, String> {
        let entry = self
            .entries
            .get_mut(url)
            .ok_or_else(|| format!("completed URL was never added: {url}"))?;
        if entry.state != UrlState::InFlight {
            return Err(format!(
                "completed URL {url} was {:?}, expected in-flight",
                entry.state
            ));
        }
        self.in_flight -= 1;

        let new_state = match outcome {
            Outcome::Done => UrlState::Done,
            Outcome::Skipped => UrlState::Skipped,
            Outcome::Failed { retry_after } => match retry_after {
                Some(backoff) => {
                    entry.not_before = Some(Instant::now() + backoff);
                    UrlState::Pending
                }
                None => UrlState::Failed,
            },
        };
        entry.state = new_state;

        if new_state == UrlState::Pending {
            self.pending += 1;
            self.buckets
                .entry(entry.record.priority)
                .or_default()
                .push_back(url.to_string());
        }
        Ok(new_state)
    }

    /// Mark a pending entry skipped (scope/robots filtered after the fact)
    pub fn skip(&mut self, url: &str) {
        if let Some(entry) = self.entries.get_mut(url)
            && matches!(entry.state, UrlState::Pending)
        {
            entry.state = UrlState::Skipped;
            self.pending -= 1;
        }
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    #[must_use]
    pub fn state_of(&self, url: &str) -> Option<UrlState> {
        self.entries.get(url).map(|e| e.state)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    /// True when no entry is pending or in-flight
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }

    /// Consistent snapshot for checkpointing
    ///
    /// In-flight entries are written out as pending: their fetches may
    /// have partially succeeded, and writer truncation on resume
    /// guarantees the refetch produces no duplicate records.
    #[must_use]
    pub fn snapshot(&self) -> FrontierSnapshot {
        let mut entries: Vec<FrontierEntry> = self
            .entries
            .values()
            .map(|e| {
                let mut copy = e.clone();
                if copy.state == UrlState::InFlight {
                    copy.state = UrlState::Pending;
                }
                copy.not_before = None;
                copy
            })
            .collect();
        // Stable order keeps snapshots byte-comparable in tests.
        entries.sort_by(|a, b| a.record.url.cmp(&b.record.url));
        FrontierSnapshot { entries }
    }

    /// Rebuild the frontier from a snapshot
    pub fn restore(&mut self, snapshot: FrontierSnapshot) {
        self.entries.clear();
        self.buckets.clear();
        self.pending = 0;
        self.in_flight = 0;
        for mut entry in snapshot.entries {
            if entry.state == UrlState::InFlight {
                entry.state = UrlState::Pending;
            }
            entry.not_before = None;
            if entry.state == UrlState::Pending {
                self.pending += 1;
                self.buckets
                    .entry(entry.record.priority)
                    .or_default()
                    .push_back(entry.record.url.clone());
            }
            self.entries.insert(entry.record.url.clone(), entry);
        }
    }
}
