//! Fetcher/Renderer Adapter Module
//!
//! Uniform interface over raw HTTP, prerender, and full-JS fetch modes.
//! Every mode produces the same [`FetchedPage`] shape so the extractor
//! pipeline and the archive writer never care how a page was obtained.

pub mod browser;
pub mod challenge;
pub mod raw;

pub use browser::BrowserFetcher;
pub use challenge::{ChallengeKind, classify_challenge};
pub use raw::RawFetcher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

use crate::atlas::records::{ErrorKind, ErrorPhase};

/// One observed sub-request while loading a page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    pub url: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Timestamps observed during one fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTiming {
    pub dispatched_at: DateTime<Utc>,
    pub response_at: Option<DateTime<Utc>>,
    pub render_complete_at: Option<DateTime<Utc>>,
}

impl FetchTiming {
    #[must_use]
    pub fn started_now() -> Self {
        Self {
            dispatched_at: Utc::now(),
            response_at: None,
            render_complete_at: None,
        }
    }
}

/// Post-load audits collected in full mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAudits {
    pub performance: serde_json::Value,
    pub accessibility: serde_json::Value,
}

/// Common return shape of every fetch mode
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects
    pub final_url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Rendered (or raw) HTML
    pub body: String,
    pub network_log: Vec<NetworkEntry>,
    pub timing: FetchTiming,
    /// Set when the response matched an anti-bot signature; challenge
    /// pages are archived but never extracted.
    pub challenge: Option<ChallengeKind>,
    /// Full-mode audits, absent in raw and prerender modes
    pub audits: Option<PageAudits>,
}

/// A failed fetch attempt, classified into the closed error-kind set
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub kind: ErrorKind,
    pub phase: ErrorPhase,
    pub message: String,
    /// HTTP status for `httpStatus` failures
    pub status: Option<u16>,
}

impl FetchFailure {
    #[must_use]
    pub fn new(kind: ErrorKind, phase: ErrorPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HttpStatus,
            phase: ErrorPhase::Fetch,
            message: message.into(),
            status: Some(status),
        }
    }

    /// Whether the retry policy admits another attempt for this failure
    ///
    /// Timeouts, connection-level failures, and 5xx (plus 408/429) are
    /// transient; everything else is terminal on first occurrence.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Timeout
            | ErrorKind::ConnectFailure
            | ErrorKind::DnsFailure
            | ErrorKind::RenderFailure => true,
            ErrorKind::HttpStatus => match self.status {
                Some(status) => status >= 500 || status == 408 || status == 429,
                None => false,
            },
            _ => false,
        }
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Classify a reqwest transport error into the closed error-kind set
///
/// reqwest does not expose a structured cause for DNS and TLS failures,
/// so those are recognized from the rendered error chain.
#[must_use]
pub fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }

    let mut chain = err.to_string().to_lowercase();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push(' ');
        chain.push_str(&cause.to_string().to_lowercase());
        source = cause.source();
    }

    if chain.contains("dns") || chain.contains("resolve") || chain.contains("lookup") {
        return ErrorKind::DnsFailure;
    }
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        return ErrorKind::TlsFailure;
    }
    ErrorKind::ConnectFailure
}

/// Uniform fetch interface implemented by raw and browser adapters
///
/// The scheduler is generic over this trait, which is also how the
/// integration tests substitute a scripted fetcher.
pub trait Fetcher: Send + Sync {
    /// Fetch one page. `attempt` is 1-based and only used for logging.
    fn fetch(
        &self,
        url: &str,
        attempt: u32,
    ) -> impl Future<Output = Result<FetchedPage, FetchFailure>> + Send;
}
