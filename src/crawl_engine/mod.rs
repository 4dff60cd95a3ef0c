//! Crawl Engine Module
//!
//! The frontier, politeness limits, coordinator, error budget, circuit
//! breaker, and the scheduler that drives them. The scheduler is the only
//! place where fetches are dispatched and results are committed.

pub mod budget;
pub mod circuit_breaker;
pub mod coordinator;
pub mod frontier;
pub mod host_limiter;
pub mod scheduler;

pub use budget::{ErrorBudget, MemoryBackpressure, resident_set_bytes};
pub use circuit_breaker::{CircuitBreaker, CircuitState, HostHealth};
pub use coordinator::{Coordinator, CoordinatorSnapshot};
pub use frontier::{
    DiscoverySource, Frontier, FrontierEntry, FrontierSnapshot, HostEligibility, LeaseDecision,
    Outcome, UrlRecord, UrlState,
};
pub use host_limiter::HostLimiter;
pub use scheduler::{CancelHandle, CrawlSummary, Scheduler, SchedulerState};

use thiserror::Error;

use crate::atlas::writer::AtlasError;
use crate::checkpoint::CheckpointError;

/// Fatal crawl outcomes, mapped onto the process exit codes
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Invalid configuration prevented startup (exit 2)
    #[error("configuration error: {0}")]
    Config(String),

    /// Browser could not be launched (exit 3)
    #[error("browser launch failed: {0}")]
    Browser(String),

    /// Archive writer I/O failure (exit 3)
    #[error("archive write failed: {0}")]
    WriterIo(#[from] AtlasError),

    /// Checkpoint I/O or validation failure (exit 3, or 2 for
    /// fingerprint/version mismatches)
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The sliding-window error rate exceeded the budget (exit 4)
    #[error("error budget exceeded")]
    ErrorBudgetExceeded,

    /// Cooperative cancellation (exit 5)
    #[error("crawl cancelled")]
    Cancelled,

    /// Invariant violation; the crawl aborts immediately (exit 10)
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl CrawlError {
    /// Process exit code for this outcome
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Checkpoint(
                CheckpointError::FingerprintMismatch { .. }
                | CheckpointError::VersionMismatch { .. },
            ) => 2,
            Self::Browser(_) | Self::WriterIo(_) | Self::Checkpoint(_) => 3,
            Self::ErrorBudgetExceeded => 4,
            Self::Cancelled => 5,
            Self::Internal(_) => 10,
        }
    }
}
