use std::time::Duration;

use cartographer::crawl_engine::frontier::{DiscoverySource, LeaseDecision, Outcome, UrlRecord};
use cartographer::crawl_engine::{Coordinator, HostLimiter};

fn record(url: &str, host: &str) -> UrlRecord {
    UrlRecord {
        url: url.to_string(),
        host: host.to_string(),
        scheme: "https".to_string(),
        depth: 0,
        source: DiscoverySource::Seed,
        discoverer: None,
        priority: 0,
    }
}

async fn lease_host(coordinator: &Coordinator) -> Option<String> {
    match coordinator.try_lease().await {
        LeaseDecision::Leased { record, .. } => Some(record.host),
        _ => None,
    }
}

#[tokio::test]
async fn per_host_cap_is_never_exceeded() {
    let coordinator = Coordinator::new(HostLimiter::new(2, Duration::ZERO));
    coordinator
        .add_urls(vec![
            record("https://a.test/1", "a.test"),
            record("https://a.test/2", "a.test"),
            record("https://a.test/3", "a.test"),
        ])
        .await;

    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
    // Third lease is blocked by the per-host cap.
    assert!(matches!(
        coordinator.try_lease().await,
        LeaseDecision::Blocked
    ));
    assert_eq!(coordinator.in_flight_count().await, 2);

    coordinator
        .complete("https://a.test/1", "a.test", Outcome::Done)
        .await
        .expect("complete");
    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
}

#[tokio::test]
async fn host_diversity_round_robin() {
    let coordinator = Coordinator::new(HostLimiter::new(1, Duration::ZERO));
    coordinator
        .add_urls(vec![
            record("https://a.test/1", "a.test"),
            record("https://a.test/2", "a.test"),
            record("https://b.test/1", "b.test"),
        ])
        .await;

    // a.test leases first (FIFO), then its cap forces b.test.
    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("b.test"));
    assert!(matches!(
        coordinator.try_lease().await,
        LeaseDecision::Blocked
    ));

    coordinator
        .complete("https://a.test/1", "a.test", Outcome::Done)
        .await
        .expect("complete");
    coordinator
        .complete("https://b.test/1", "b.test", Outcome::Done)
        .await
        .expect("complete");
    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
}

#[tokio::test]
async fn politeness_delay_defers_leases() {
    let coordinator = Coordinator::new(HostLimiter::new(4, Duration::from_secs(5)));
    coordinator
        .add_urls(vec![
            record("https://a.test/1", "a.test"),
            record("https://a.test/2", "a.test"),
        ])
        .await;

    assert_eq!(lease_host(&coordinator).await.as_deref(), Some("a.test"));
    // Second lease to the same host must wait out the delay window.
    match coordinator.try_lease().await {
        LeaseDecision::Wait(at) => {
            assert!(at > std::time::Instant::now());
        }
        other => panic!("expected wait, got {other:?}"),
    }
}

#[tokio::test]
async fn claim_page_enforces_the_cap() {
    let coordinator = Coordinator::new(HostLimiter::new(1, Duration::ZERO));
    assert_eq!(
        coordinator.claim_page(Some(2)).await.as_deref(),
        Some("p00000001")
    );
    assert_eq!(
        coordinator.claim_page(Some(2)).await.as_deref(),
        Some("p00000002")
    );
    assert_eq!(coordinator.claim_page(Some(2)).await, None);
    assert_eq!(coordinator.claim_page(None).await.as_deref(), Some("p00000003"));
}

#[tokio::test]
async fn snapshot_restores_counters_and_sequence() {
    let coordinator = Coordinator::new(HostLimiter::new(1, Duration::ZERO));
    coordinator
        .add_urls(vec![record("https://a.test/1", "a.test")])
        .await;
    coordinator.claim_page(None).await.expect("claim");
    coordinator.record_page_done().await;
    coordinator.record_bytes_written(128).await;

    let snapshot = coordinator.snapshot().await;
    assert_eq!(snapshot.page_seq, 1);
    assert_eq!(snapshot.counters.pages_done, 1);

    let restored = Coordinator::new(HostLimiter::new(1, Duration::ZERO));
    restored.restore(snapshot).await;
    assert_eq!(restored.pages_done().await, 1);
    assert_eq!(
        restored.claim_page(None).await.as_deref(),
        Some("p00000002")
    );
}
