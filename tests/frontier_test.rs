use std::time::{Duration, Instant};

use cartographer::crawl_engine::frontier::{
    DiscoverySource, Frontier, HostEligibility, LeaseDecision, Outcome, UrlRecord, UrlState,
};

fn record(url: &str, host: &str, depth: u32) -> UrlRecord {
    UrlRecord {
        url: url.to_string(),
        host: host.to_string(),
        scheme: "https".to_string(),
        depth,
        source: DiscoverySource::Link,
        discoverer: None,
        priority: 0,
    }
}

fn ready(_host: &str) -> HostEligibility {
    HostEligibility::Ready { rank: 0 }
}

fn lease_url(frontier: &mut Frontier) -> Option<String> {
    match frontier.lease(Instant::now(), ready) {
        LeaseDecision::Leased { record, .. } => Some(record.url),
        _ => None,
    }
}

#[test]
fn add_is_noop_for_seen_urls() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/x", "a.test", 2));
    frontier.add(record("https://a.test/x", "a.test", 5));
    assert_eq!(frontier.pending_count(), 1);
}

#[test]
fn lower_depth_updates_without_state_reset() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/x", "a.test", 4));
    let leased = lease_url(&mut frontier).expect("lease");
    assert_eq!(leased, "https://a.test/x");

    // Re-adding at a lower depth while in-flight updates the depth only.
    frontier.add(record("https://a.test/x", "a.test", 1));
    assert_eq!(frontier.state_of("https://a.test/x"), Some(UrlState::InFlight));
    assert_eq!(frontier.pending_count(), 0);

    frontier
        .complete("https://a.test/x", Outcome::Done)
        .expect("complete");
    let snapshot = frontier.snapshot();
    assert_eq!(snapshot.entries[0].record.depth, 1);
}

#[test]
fn lease_is_fifo_within_priority() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    frontier.add(record("https://a.test/2", "a.test", 0));
    assert_eq!(lease_url(&mut frontier).as_deref(), Some("https://a.test/1"));
    assert_eq!(lease_url(&mut frontier).as_deref(), Some("https://a.test/2"));
}

#[test]
fn higher_priority_leases_first() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/low", "a.test", 0));
    let mut important = record("https://a.test/high", "a.test", 0);
    important.priority = 10;
    frontier.add(important);
    assert_eq!(lease_url(&mut frontier).as_deref(), Some("https://a.test/high"));
}

#[test]
fn saturated_hosts_are_skipped_but_not_reordered() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    frontier.add(record("https://a.test/2", "a.test", 0));
    frontier.add(record("https://b.test/1", "b.test", 0));

    // a.test at its cap: the b.test entry is chosen instead.
    let decision = frontier.lease(Instant::now(), |host| {
        if host == "a.test" {
            HostEligibility::Saturated
        } else {
            HostEligibility::Ready { rank: 0 }
        }
    });
    match decision {
        LeaseDecision::Leased { record, .. } => assert_eq!(record.url, "https://b.test/1"),
        other => panic!("expected lease, got {other:?}"),
    }

    // Once a.test frees up, its first entry still leases first.
    assert_eq!(lease_url(&mut frontier).as_deref(), Some("https://a.test/1"));
}

#[test]
fn round_robin_prefers_oldest_served_host() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    frontier.add(record("https://b.test/1", "b.test", 0));

    let decision = frontier.lease(Instant::now(), |host| match host {
        "a.test" => HostEligibility::Ready { rank: 9 },
        _ => HostEligibility::Ready { rank: 1 },
    });
    match decision {
        LeaseDecision::Leased { record, .. } => assert_eq!(record.host, "b.test"),
        other => panic!("expected lease, got {other:?}"),
    }
}

#[test]
fn delayed_hosts_produce_wait_decision() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    let ready_at = Instant::now() + Duration::from_secs(2);
    let decision = frontier.lease(Instant::now(), |_| HostEligibility::DelayedUntil(ready_at));
    match decision {
        LeaseDecision::Wait(at) => assert_eq!(at, ready_at),
        other => panic!("expected wait, got {other:?}"),
    }
}

#[test]
fn failed_with_retry_returns_to_pending_after_backoff() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    lease_url(&mut frontier).expect("lease");

    let state = frontier
        .complete(
            "https://a.test/1",
            Outcome::Failed {
                retry_after: Some(Duration::from_millis(50)),
            },
        )
        .expect("complete");
    assert_eq!(state, UrlState::Pending);

    // Not yet eligible: the lease reports when to come back.
    assert!(matches!(
        frontier.lease(Instant::now(), ready),
        LeaseDecision::Wait(_)
    ));

    std::thread::sleep(Duration::from_millis(60));
    match frontier.lease(Instant::now(), ready) {
        LeaseDecision::Leased { attempt, .. } => assert_eq!(attempt, 2),
        other => panic!("expected lease, got {other:?}"),
    }
}

#[test]
fn terminal_failure_and_completion_are_monotonic() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    lease_url(&mut frontier).expect("lease");
    frontier
        .complete("https://a.test/1", Outcome::Failed { retry_after: None })
        .expect("complete");
    assert_eq!(frontier.state_of("https://a.test/1"), Some(UrlState::Failed));

    // Completing a non-in-flight entry is an invariant violation.
    assert!(frontier
        .complete("https://a.test/1", Outcome::Done)
        .is_err());
    assert!(frontier.is_drained());
}

#[test]
fn snapshot_maps_in_flight_to_pending() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    frontier.add(record("https://a.test/2", "a.test", 0));
    lease_url(&mut frontier).expect("lease");

    let snapshot = frontier.snapshot();
    assert!(snapshot.entries.iter().all(|e| e.state == UrlState::Pending));

    let mut restored = Frontier::new();
    restored.restore(snapshot);
    assert_eq!(restored.pending_count(), 2);
    assert_eq!(restored.in_flight_count(), 0);

    // Both entries lease again after restore.
    assert!(lease_url(&mut restored).is_some());
    assert!(lease_url(&mut restored).is_some());
    assert!(lease_url(&mut restored).is_none());
}

#[test]
fn absorb_redirect_never_refetches_target() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/old", "a.test", 0));
    lease_url(&mut frontier).expect("lease");

    // Redirect target unseen: recorded as done.
    frontier.absorb_redirect(record("https://a.test/new", "a.test", 0));
    assert_eq!(frontier.state_of("https://a.test/new"), Some(UrlState::Done));

    // Redirect target already pending: retired as skipped.
    frontier.add(record("https://a.test/pending", "a.test", 1));
    frontier.absorb_redirect(record("https://a.test/pending", "a.test", 0));
    assert_eq!(
        frontier.state_of("https://a.test/pending"),
        Some(UrlState::Skipped)
    );
    assert_eq!(frontier.pending_count(), 0);
}

#[test]
fn seen_urls_do_not_requeue_after_completion() {
    let mut frontier = Frontier::new();
    frontier.add(record("https://a.test/1", "a.test", 0));
    lease_url(&mut frontier).expect("lease");
    frontier
        .complete("https://a.test/1", Outcome::Done)
        .expect("complete");

    frontier.add(record("https://a.test/1", "a.test", 0));
    assert_eq!(frontier.pending_count(), 0);
    assert!(frontier.is_drained());
}
