//! Per-host politeness limits
//!
//! Tracks, for every host, the in-flight count against the per-host cap K
//! and the last dispatch time against the minimum inter-request delay D.
//! Robots `Crawl-delay` overrides D when it is at least as large. The
//! table also keeps a monotonically increasing served tick per host, which
//! the frontier uses to round-robin across ready hosts.
//!
//! The limiter is plain data owned by the coordinator; serialization of
//! access comes from the coordinator's lock, not from this type.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::frontier::HostEligibility;

#[derive(Debug, Default)]
struct HostState {
    in_flight: usize,
    last_dispatch: Option<Instant>,
    /// Tick of the most recent lease for this host (0 = never served)
    last_served: u64,
    crawl_delay: Option<Duration>,
}

/// Per-host delay and concurrency bookkeeping
#[derive(Debug)]
pub struct HostLimiter {
    hosts: HashMap<String, HostState>,
    max_per_host: usize,
    default_delay: Duration,
    served_ticks: u64,
}

impl HostLimiter {
    #[must_use]
    pub fn new(max_per_host: usize, default_delay: Duration) -> Self {
        Self {
            hosts: HashMap::new(),
            max_per_host: max_per_host.max(1),
            default_delay,
            served_ticks: 0,
        }
    }

    /// Effective inter-request delay for a host
    #[must_use]
    pub fn delay_for(&self, host: &str) -> Duration {
        match self.hosts.get(host).and_then(|h| h.crawl_delay) {
            Some(robots_delay) if robots_delay >= self.default_delay => robots_delay,
            _ => self.default_delay,
        }
    }

    /// Record the robots `Crawl-delay` learned for a host
    pub fn set_crawl_delay(&mut self, host: &str, delay: Option<Duration>) {
        if let Some(delay) = delay {
            self.hosts.entry(host.to_string()).or_default().crawl_delay = Some(delay);
        }
    }

    /// Answer whether a host can take another fetch right now
    #[must_use]
    pub fn eligibility(&self, host: &str, now: Instant) -> HostEligibility {
        let delay = self.delay_for(host);
        match self.hosts.get(host) {
            None => HostEligibility::Ready { rank: 0 },
            Some(state) => {
                if state.in_flight >= self.max_per_host {
                    return HostEligibility::Saturated;
                }
                if let Some(last) = state.last_dispatch {
                    let ready_at = last + delay;
                    if ready_at > now {
                        return HostEligibility::DelayedUntil(ready_at);
                    }
                }
                HostEligibility::Ready {
                    rank: state.last_served,
                }
            }
        }
    }

    /// Take a slot on a host. Caller must have seen `Ready` under the
    /// same coordinator lock.
    pub fn acquire(&mut self, host: &str, now: Instant) {
        self.served_ticks += 1;
        let tick = self.served_ticks;
        let state = self.hosts.entry(host.to_string()).or_default();
        state.in_flight += 1;
        // Start-to-start spacing: the delay clock runs from dispatch,
        // and is pushed forward again on release.
        state.last_dispatch = Some(now);
        state.last_served = tick;
    }

    /// Return a slot. Re-stamps the dispatch clock with the release time.
    pub fn release(&mut self, host: &str, now: Instant) {
        if let Some(state) = self.hosts.get_mut(host) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.last_dispatch = Some(now);
        }
    }

    #[must_use]
    pub fn in_flight(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, |h| h.in_flight)
    }

    /// Hosts ordered oldest-served first, for checkpointing the
    /// round-robin position
    #[must_use]
    pub fn host_order(&self) -> Vec<String> {
        let mut hosts: Vec<(&String, u64)> = self
            .hosts
            .iter()
            .map(|(host, state)| (host, state.last_served))
            .collect();
        hosts.sort_by_key(|(_, tick)| *tick);
        hosts.into_iter().map(|(host, _)| host.clone()).collect()
    }

    /// Restore the round-robin position from a checkpoint
    pub fn restore_host_order(&mut self, order: &[String]) {
        for (i, host) in order.iter().enumerate() {
            self.served_ticks = (i as u64) + 1;
            self.hosts.entry(host.clone()).or_default().last_served = self.served_ticks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_host_is_ready_with_zero_rank() {
        let limiter = HostLimiter::new(2, Duration::from_millis(100));
        assert!(matches!(
            limiter.eligibility("a.test", Instant::now()),
            HostEligibility::Ready { rank: 0 }
        ));
    }

    #[test]
    fn saturation_at_per_host_cap() {
        let mut limiter = HostLimiter::new(2, Duration::ZERO);
        let now = Instant::now();
        limiter.acquire("a.test", now);
        limiter.acquire("a.test", now);
        assert!(matches!(
            limiter.eligibility("a.test", now),
            HostEligibility::Saturated
        ));
        limiter.release("a.test", now);
        assert!(matches!(
            limiter.eligibility("a.test", now),
            HostEligibility::Ready { .. }
        ));
    }

    #[test]
    fn delay_window_defers() {
        let mut limiter = HostLimiter::new(4, Duration::from_secs(5));
        let now = Instant::now();
        limiter.acquire("a.test", now);
        limiter.release("a.test", now);
        match limiter.eligibility("a.test", now + Duration::from_secs(1)) {
            HostEligibility::DelayedUntil(at) => assert_eq!(at, now + Duration::from_secs(5)),
            other => panic!("expected delay, got {other:?}"),
        }
        assert!(matches!(
            limiter.eligibility("a.test", now + Duration::from_secs(5)),
            HostEligibility::Ready { .. }
        ));
    }

    #[test]
    fn robots_delay_only_overrides_upward() {
        let mut limiter = HostLimiter::new(2, Duration::from_secs(2));
        limiter.set_crawl_delay("slow.test", Some(Duration::from_secs(10)));
        limiter.set_crawl_delay("fast.test", Some(Duration::from_secs(1)));
        assert_eq!(limiter.delay_for("slow.test"), Duration::from_secs(10));
        assert_eq!(limiter.delay_for("fast.test"), Duration::from_secs(2));
    }

    #[test]
    fn round_robin_rank_orders_by_service_time() {
        let mut limiter = HostLimiter::new(2, Duration::ZERO);
        let now = Instant::now();
        limiter.acquire("a.test", now);
        limiter.acquire("b.test", now);
        limiter.release("a.test", now);
        limiter.release("b.test", now);
        let rank_a = match limiter.eligibility("a.test", now) {
            HostEligibility::Ready { rank } => rank,
            other => panic!("expected ready, got {other:?}"),
        };
        let rank_b = match limiter.eligibility("b.test", now) {
            HostEligibility::Ready { rank } => rank,
            other => panic!("expected ready, got {other:?}"),
        };
        assert!(rank_a < rank_b, "a was served before b");
        assert_eq!(
            limiter.host_order(),
            vec!["a.test".to_string(), "b.test".to_string()]
        );
    }
}
