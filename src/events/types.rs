//! Event type definitions for the crawl event system
//!
//! Lifecycle events published by the scheduler. Payloads carry the rolling
//! counters so subscribers (CLI progress, tests) never have to reach into
//! scheduler state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::atlas::records::{CrawlCounters, ErrorKind};

/// Events emitted during the crawl lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CrawlEvent {
    /// Emitted once when the crawl session starts
    CrawlStarted {
        seeds: Vec<String>,
        out_dir: PathBuf,
        max_depth: u32,
        timestamp: DateTime<Utc>,
    },
    /// Emitted after each completed fetch (success or failure)
    Progress {
        counters: CrawlCounters,
        frontier_pending: usize,
        in_flight: usize,
        timestamp: DateTime<Utc>,
    },
    /// Emitted after a checkpoint has been made durable
    CheckpointWritten {
        pages_done: u64,
        path: PathBuf,
        timestamp: DateTime<Utc>,
    },
    /// Emitted once when the crawl reaches the stopped state
    CrawlFinished {
        counters: CrawlCounters,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },
    /// Emitted for per-URL errors as they are recorded
    CrawlError {
        url: String,
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl CrawlEvent {
    /// Create a `CrawlStarted` event
    #[must_use]
    pub fn crawl_started(seeds: Vec<String>, out_dir: PathBuf, max_depth: u32) -> Self {
        Self::CrawlStarted {
            seeds,
            out_dir,
            max_depth,
            timestamp: Utc::now(),
        }
    }

    /// Create a `Progress` event
    #[must_use]
    pub fn progress(counters: CrawlCounters, frontier_pending: usize, in_flight: usize) -> Self {
        Self::Progress {
            counters,
            frontier_pending,
            in_flight,
            timestamp: Utc::now(),
        }
    }

    /// Create a `CheckpointWritten` event
    #[must_use]
    pub fn checkpoint_written(pages_done: u64, path: PathBuf) -> Self {
        Self::CheckpointWritten {
            pages_done,
            path,
            timestamp: Utc::now(),
        }
    }

    /// Create a `CrawlFinished` event
    #[must_use]
    pub fn crawl_finished(counters: CrawlCounters, duration: Duration) -> Self {
        Self::CrawlFinished {
            counters,
            duration,
            timestamp: Utc::now(),
        }
    }

    /// Create a `CrawlError` event
    #[must_use]
    pub fn crawl_error(url: String, kind: ErrorKind, message: String) -> Self {
        Self::CrawlError {
            url,
            kind,
            message,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of this event, matching the documented event surface
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CrawlStarted { .. } => "crawl.start",
            Self::Progress { .. } => "crawl.progress",
            Self::CheckpointWritten { .. } => "crawl.checkpoint",
            Self::CrawlFinished { .. } => "crawl.finished",
            Self::CrawlError { .. } => "crawl.error",
        }
    }
}
