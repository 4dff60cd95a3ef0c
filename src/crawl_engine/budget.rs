//! Error budget and memory backpressure
//!
//! The error budget watches a sliding window of the last W completed
//! fetches and trips once the window is full and the error rate exceeds
//! the configured threshold. Robots disallows and challenge pages never
//! enter the window.
//!
//! Backpressure watches the resident set: above the high-water mark the
//! scheduler halves its effective concurrency (floor 1), and restores it
//! once usage falls below the low-water mark.

use log::{info, warn};
use std::collections::VecDeque;

/// Sliding-window error rate tracker
#[derive(Debug)]
pub struct ErrorBudget {
    window: VecDeque<bool>,
    window_size: usize,
    max_error_rate: f64,
}

impl ErrorBudget {
    #[must_use]
    pub fn new(window_size: usize, max_error_rate: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
            max_error_rate,
        }
    }

    /// Record one completed fetch. Returns true when this completion
    /// trips the budget.
    pub fn record(&mut self, is_error: bool) -> bool {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(is_error);
        let tripped = self.is_tripped();
        if tripped {
            warn!(
                "Error budget exceeded: {}/{} failures in window (threshold {:.2})",
                self.error_count(),
                self.window_size,
                self.max_error_rate
            );
        }
        tripped
    }

    fn error_count(&self) -> usize {
        self.window.iter().filter(|e| **e).count()
    }

    /// The budget only trips on a full window, so short crawls with a few
    /// early failures are not aborted prematurely.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        if self.window.len() < self.window_size {
            return false;
        }
        let rate = self.error_count() as f64 / self.window_size as f64;
        rate > self.max_error_rate
    }

    #[must_use]
    pub fn current_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.error_count() as f64 / self.window.len() as f64
    }
}

/// Resident-set estimate for the current process, in bytes
///
/// Reads `/proc/self/statm` on Linux; returns `None` where that is
/// unavailable, which disables backpressure.
#[must_use]
pub fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Hysteresis between the two memory watermarks
#[derive(Debug)]
pub struct MemoryBackpressure {
    high_water: u64,
    low_water: u64,
    engaged: bool,
}

impl MemoryBackpressure {
    #[must_use]
    pub fn new(low_water: u64, high_water: u64) -> Self {
        Self {
            high_water,
            low_water,
            engaged: false,
        }
    }

    /// Feed a resident-set sample; returns whether backpressure is now
    /// engaged.
    pub fn update(&mut self, resident_bytes: u64) -> bool {
        if !self.engaged && resident_bytes > self.high_water {
            self.engaged = true;
            warn!(
                "Memory backpressure engaged: resident {resident_bytes} bytes above high-water {}",
                self.high_water
            );
        } else if self.engaged && resident_bytes < self.low_water {
            self.engaged = false;
            info!(
                "Memory backpressure released: resident {resident_bytes} bytes below low-water {}",
                self.low_water
            );
        }
        self.engaged
    }

    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Effective concurrency under the current pressure state
    #[must_use]
    pub fn effective_concurrency(&self, configured: usize) -> usize {
        if self.engaged {
            (configured / 2).max(1)
        } else {
            configured
        }
    }
}
