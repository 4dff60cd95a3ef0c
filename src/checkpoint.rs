//! Checkpoint manager: durable crawl snapshots and the resume protocol
//!
//! A checkpoint is a schema-versioned, opaque JSON blob: frontier state,
//! counters, writer offsets, and scheduler tie-break state. It is written
//! to a temp sibling and atomically renamed, and fsynced before the
//! rename, so a reader never observes a torn snapshot. Consumers load it
//! only through [`CheckpointManager::load`], which fails fast on a
//! version or config-fingerprint mismatch.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time::timeout;

use crate::atlas::records::CrawlCounters;
use crate::atlas::writer::PartOffsets;
use crate::crawl_engine::frontier::FrontierSnapshot;

/// Current checkpoint schema version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Timeout for the blocking write+fsync+rename of a checkpoint
const BLOCKING_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by checkpoint persistence and resume
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint schema version {found} is not understood (supported: {supported})")]
    VersionMismatch { found: u32, supported: u32 },
    #[error(
        "config fingerprint mismatch: checkpoint was written under {recorded}, current config is {current}"
    )]
    FingerprintMismatch { recorded: String, current: String },
    #[error("no checkpoint found at {0}")]
    NotFound(PathBuf),
}

/// Durable snapshot of everything needed to resume a crawl
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub config_fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Archive start time, carried across resumes into the manifest
    pub started_at: DateTime<Utc>,
    pub frontier: FrontierSnapshot,
    pub counters: CrawlCounters,
    /// Page id sequence position
    pub page_seq: u64,
    /// Per-part durable offsets for resumable truncation
    pub writer_offsets: BTreeMap<String, PartOffsets>,
    /// Host round-robin position, oldest-served first
    pub host_order: Vec<String>,
    /// Seed for the retry backoff jitter
    pub backoff_seed: u64,
}

/// Owns the checkpoint file next to the archive parts
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(out_dir: &Path) -> Self {
        Self {
            path: out_dir.join("checkpoint.json"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write a checkpoint durably: temp sibling, fsync, atomic rename
    ///
    /// The write, fsync, and rename run via `tokio::task::spawn_blocking`
    /// so periodic checkpoints never stall the async runtime.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| std::io::Error::other("checkpoint path has no parent"))?
            .to_path_buf();
        let path = self.path.clone();
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let pages_done = checkpoint.counters.pages_done;
        let entry_count = checkpoint.frontier.entries.len();

        let blocking_task =
            tokio::task::spawn_blocking(move || -> Result<(), CheckpointError> {
                std::fs::create_dir_all(&parent)?;
                let mut temp = NamedTempFile::new_in(&parent)?;
                temp.write_all(&json)?;
                temp.as_file().sync_all()?;
                temp.persist(&path).map_err(|e| CheckpointError::Io(e.error))?;
                Ok(())
            });

        match timeout(BLOCKING_WRITE_TIMEOUT, blocking_task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(CheckpointError::Io(std::io::Error::other(format!(
                    "blocking checkpoint task panicked: {e}"
                ))));
            }
            Err(_) => {
                return Err(CheckpointError::Io(std::io::Error::other(format!(
                    "checkpoint write timed out after {BLOCKING_WRITE_TIMEOUT:?}"
                ))));
            }
        }

        debug!("Checkpoint written: {pages_done} pages done, {entry_count} frontier entries");
        Ok(())
    }

    /// Load and validate a checkpoint against the current config
    pub fn load(&self, current_fingerprint: &str) -> Result<Checkpoint, CheckpointError> {
        if !self.path.exists() {
            return Err(CheckpointError::NotFound(self.path.clone()));
        }
        let file = std::fs::File::open(&self.path)?;
        let checkpoint: Checkpoint = serde_json::from_reader(file)?;

        if checkpoint.schema_version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: checkpoint.schema_version,
                supported: CHECKPOINT_VERSION,
            });
        }
        if checkpoint.config_fingerprint != current_fingerprint {
            return Err(CheckpointError::FingerprintMismatch {
                recorded: checkpoint.config_fingerprint,
                current: current_fingerprint.to_string(),
            });
        }

        info!(
            "Loaded checkpoint from {} ({} pages done)",
            self.path.display(),
            checkpoint.counters.pages_done
        );
        Ok(checkpoint)
    }

    /// Remove the checkpoint file, e.g. after a clean close
    pub fn remove(&self) -> Result<(), CheckpointError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
