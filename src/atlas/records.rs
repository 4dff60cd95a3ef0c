//! Record schemas for Atlas archive parts
//!
//! Every part of an Atlas is newline-delimited JSON, one record per line.
//! The types here define the row schemas for the built-in parts (`pages`,
//! `edges`, `assets`, `errors`). Records are immutable once emitted; the
//! writer never rewrites a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::FetchMode;
use crate::fetch::ChallengeKind;

/// Closed set of error kinds recorded in the `errors` part and tracked
/// in crawl counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Config,
    RobotsDisallow,
    DnsFailure,
    ConnectFailure,
    TlsFailure,
    HttpStatus,
    Timeout,
    BodyTooLarge,
    ChallengeDetected,
    RenderFailure,
    ExtractorFailure,
    #[serde(rename = "writerIO")]
    WriterIo,
    #[serde(rename = "checkpointIO")]
    CheckpointIo,
    Internal,
}

impl ErrorKind {
    /// Whether errors of this kind count toward the error budget.
    ///
    /// Robots disallows and challenge pages are expected outcomes of a
    /// polite crawl, not failures of the crawler.
    #[must_use]
    pub const fn counts_toward_budget(&self) -> bool {
        !matches!(self, Self::RobotsDisallow | Self::ChallengeDetected)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::RobotsDisallow => "robotsDisallow",
            Self::DnsFailure => "dnsFailure",
            Self::ConnectFailure => "connectFailure",
            Self::TlsFailure => "tlsFailure",
            Self::HttpStatus => "httpStatus",
            Self::Timeout => "timeout",
            Self::BodyTooLarge => "bodyTooLarge",
            Self::ChallengeDetected => "challengeDetected",
            Self::RenderFailure => "renderFailure",
            Self::ExtractorFailure => "extractorFailure",
            Self::WriterIo => "writerIO",
            Self::CheckpointIo => "checkpointIO",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Pipeline phase in which an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPhase {
    Fetch,
    Render,
    Extract,
    Write,
}

/// Timestamps collected across the fetch/render/extract lifecycle of a page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTiming {
    /// When the scheduler dispatched the fetch
    pub dispatched_at: DateTime<Utc>,
    /// When the final response (or rendered navigation) arrived
    pub response_at: Option<DateTime<Utc>>,
    /// When rendering settled (browser modes only)
    pub render_complete_at: Option<DateTime<Utc>>,
    /// When the extractor pipeline finished
    pub extraction_complete_at: Option<DateTime<Utc>>,
}

/// One row in the `pages` part
///
/// Exactly one page record is emitted per successfully fetched URL, before
/// any of its edges or assets, so readers can rely on the page row
/// preceding its children within the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    /// Stable sequence-assigned page id (`p`-prefixed, zero padded)
    pub id: String,
    /// Final URL after redirects
    pub url: String,
    /// URL as it was leased from the frontier
    pub requested_url: String,
    /// HTTP status of the final response
    pub status: u16,
    /// Fetch mode actually used
    pub fetch_mode: FetchMode,
    /// Crawl depth (seeds are 0)
    pub depth: u32,
    pub timing: PageTiming,
    /// Raw response headers of the final response
    pub headers: BTreeMap<String, String>,
    /// Hex SHA-256 of the rendered HTML
    pub html_hash: String,
    /// Set when the response was classified as an anti-bot interstitial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeKind>,
}

/// Link relation attributes carried on an anchor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRel {
    pub nofollow: bool,
    pub sponsored: bool,
    pub ugc: bool,
}

/// One row in the `edges` part: a single outgoing link from a page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    /// Id of the page the link was found on
    pub source_page: String,
    /// Link target exactly as written in the document
    pub target_url: String,
    /// Normalized absolute target, when the target parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_target: Option<String>,
    /// Anchor text, whitespace-collapsed
    pub text: String,
    pub rel: LinkRel,
    /// Whether the target is in crawl scope
    pub internal: bool,
    /// Fetch mode the discovering page was rendered under
    pub discovery: FetchMode,
}

/// Asset category for `AssetRecord`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    Image,
    Script,
    Style,
    Media,
    Other,
}

/// One row in the `assets` part: a sub-resource referenced by a page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    /// Id of the owning page
    pub page: String,
    pub url: String,
    pub kind: AssetKind,
    /// Transfer size in bytes when observed on the network log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Hex SHA-256 of the body, when the asset was downloaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// One row in the `errors` part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub phase: ErrorPhase,
    pub url: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number that produced this error (1 = first attempt)
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(phase: ErrorPhase, url: &str, kind: ErrorKind, message: String, attempt: u32) -> Self {
        Self {
            phase,
            url: url.to_string(),
            kind,
            message,
            attempt,
            timestamp: Utc::now(),
        }
    }
}

/// Rolling totals carried by progress events and checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlCounters {
    pub pages_done: u64,
    pub errors_total: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub bytes_written: u64,
}

impl CrawlCounters {
    pub fn record_error(&mut self, kind: ErrorKind) {
        self.errors_total += 1;
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_to_closed_names() {
        let json = serde_json::to_string(&ErrorKind::RobotsDisallow).expect("serialize");
        assert_eq!(json, "\"robotsDisallow\"");
        let json = serde_json::to_string(&ErrorKind::WriterIo).expect("serialize");
        assert_eq!(json, "\"writerIO\"");
        let json = serde_json::to_string(&ErrorKind::CheckpointIo).expect("serialize");
        assert_eq!(json, "\"checkpointIO\"");
    }

    #[test]
    fn expected_outcomes_do_not_count_toward_budget() {
        assert!(!ErrorKind::RobotsDisallow.counts_toward_budget());
        assert!(!ErrorKind::ChallengeDetected.counts_toward_budget());
        assert!(ErrorKind::Timeout.counts_toward_budget());
        assert!(ErrorKind::HttpStatus.counts_toward_budget());
    }

    #[test]
    fn counters_accumulate_by_kind() {
        let mut counters = CrawlCounters::default();
        counters.record_error(ErrorKind::Timeout);
        counters.record_error(ErrorKind::Timeout);
        counters.record_error(ErrorKind::HttpStatus);
        assert_eq!(counters.errors_total, 3);
        assert_eq!(counters.errors_by_kind[&ErrorKind::Timeout], 2);
        assert_eq!(counters.errors_by_kind[&ErrorKind::HttpStatus], 1);
    }
}
