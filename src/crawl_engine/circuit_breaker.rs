//! Circuit breaker for host-level failure detection
//!
//! Consistently failing hosts are short-circuited so the crawl does not
//! burn its error budget and politeness delay on a dead origin. State per
//! host:
//! - Closed: normal operation, leases proceed
//! - Open: too many consecutive failures, leases are refused
//! - `HalfOpen`: cooldown elapsed, probing with live traffic

use dashmap::DashMap;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Circuit state for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// Failure accounting for a single host
#[derive(Debug, Clone)]
pub struct HostHealth {
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    pub total_successes: u32,
    /// When the circuit last opened, for cooldown measurement
    pub opened_at: Option<Instant>,
    /// Consecutive successes observed while `HalfOpen`
    pub probe_successes: u32,
    pub state: CircuitState,
}

impl HostHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            opened_at: None,
            probe_successes: 0,
            state: CircuitState::Closed,
        }
    }
}

/// Tracks host health and refuses leases to hosts that keep failing
pub struct CircuitBreaker {
    hosts: DashMap<String, HostHealth>,
    /// Consecutive failures that open the circuit
    failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    success_threshold: u32,
    /// Cooldown before an open circuit admits a probe
    cooldown: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            hosts: DashMap::new(),
            failure_threshold,
            success_threshold,
            cooldown,
        }
    }

    /// Whether a fetch to this host should be attempted
    ///
    /// An Open circuit transitions to `HalfOpen` here once the cooldown
    /// has elapsed, so the check itself drives recovery.
    pub fn should_attempt(&self, host: &str) -> bool {
        let mut health = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(HostHealth::new);

        match health.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(opened) = health.opened_at
                    && opened.elapsed() >= self.cooldown
                {
                    health.state = CircuitState::HalfOpen;
                    health.probe_successes = 0;
                    info!("Circuit half-open for host {host} after {:?} cooldown", opened.elapsed());
                    return true;
                }
                false
            }
        }
    }

    /// Record a successful fetch
    pub fn record_success(&self, host: &str) {
        if let Some(mut health) = self.hosts.get_mut(host) {
            health.consecutive_failures = 0;
            health.total_successes += 1;
            health.total_attempts += 1;

            if health.state == CircuitState::HalfOpen {
                health.probe_successes += 1;
                if health.probe_successes >= self.success_threshold {
                    health.state = CircuitState::Closed;
                    info!("Circuit closed for host {host}");
                }
            }
        }
    }

    /// Record a failed fetch; may open the circuit
    pub fn record_failure(&self, host: &str, error: &str) {
        let mut health = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(HostHealth::new);

        health.consecutive_failures += 1;
        health.total_attempts += 1;

        if health.consecutive_failures >= self.failure_threshold
            && health.state != CircuitState::Open
        {
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
            health.probe_successes = 0;
            warn!(
                "Circuit open for host {host} after {} consecutive failures: {error}",
                health.consecutive_failures
            );
        } else {
            debug!(
                "Failure for host {host} ({}/{}): {error}",
                health.consecutive_failures, self.failure_threshold
            );
        }
    }

    #[must_use]
    pub fn health_of(&self, host: &str) -> Option<HostHealth> {
        self.hosts.get(host).map(|h| h.value().clone())
    }
}
