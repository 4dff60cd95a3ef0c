use std::collections::BTreeMap;
use tempfile::TempDir;

use cartographer::atlas::records::CrawlCounters;
use cartographer::checkpoint::{
    CHECKPOINT_VERSION, Checkpoint, CheckpointError, CheckpointManager,
};
use cartographer::crawl_engine::frontier::{
    DiscoverySource, Frontier, UrlRecord,
};

fn sample_checkpoint(fingerprint: &str) -> Checkpoint {
    let mut frontier = Frontier::new();
    frontier.add(UrlRecord {
        url: "https://a.test/".to_string(),
        host: "a.test".to_string(),
        scheme: "https".to_string(),
        depth: 0,
        source: DiscoverySource::Seed,
        discoverer: None,
        priority: 0,
    });
    Checkpoint {
        schema_version: CHECKPOINT_VERSION,
        config_fingerprint: fingerprint.to_string(),
        created_at: chrono::Utc::now(),
        started_at: chrono::Utc::now(),
        frontier: frontier.snapshot(),
        counters: CrawlCounters::default(),
        page_seq: 7,
        writer_offsets: BTreeMap::new(),
        host_order: vec!["a.test".to_string()],
        backoff_seed: 42,
    }
}

#[tokio::test]
async fn write_then_load_round_trips() {
    let dir = TempDir::new().expect("temp dir");
    let manager = CheckpointManager::new(dir.path());
    assert!(!manager.exists());

    manager.write(&sample_checkpoint("fp")).await.expect("write");
    assert!(manager.exists());

    let loaded = manager.load("fp").expect("load");
    assert_eq!(loaded.page_seq, 7);
    assert_eq!(loaded.backoff_seed, 42);
    assert_eq!(loaded.frontier.entries.len(), 1);
    assert_eq!(loaded.host_order, vec!["a.test".to_string()]);
}

#[tokio::test]
async fn fingerprint_mismatch_fails_resume() {
    let dir = TempDir::new().expect("temp dir");
    let manager = CheckpointManager::new(dir.path());
    manager.write(&sample_checkpoint("fp-old")).await.expect("write");

    assert!(matches!(
        manager.load("fp-new"),
        Err(CheckpointError::FingerprintMismatch { .. })
    ));
}

#[tokio::test]
async fn unknown_schema_version_fails_resume() {
    let dir = TempDir::new().expect("temp dir");
    let manager = CheckpointManager::new(dir.path());
    let mut checkpoint = sample_checkpoint("fp");
    checkpoint.schema_version = 99;
    manager.write(&checkpoint).await.expect("write");

    assert!(matches!(
        manager.load("fp"),
        Err(CheckpointError::VersionMismatch { found: 99, .. })
    ));
}

#[test]
fn missing_checkpoint_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let manager = CheckpointManager::new(dir.path());
    assert!(matches!(
        manager.load("fp"),
        Err(CheckpointError::NotFound(_))
    ));
}

#[tokio::test]
async fn remove_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    let manager = CheckpointManager::new(dir.path());
    manager.write(&sample_checkpoint("fp")).await.expect("write");
    manager.remove().expect("remove");
    assert!(!manager.exists());
    manager.remove().expect("second remove");
}
