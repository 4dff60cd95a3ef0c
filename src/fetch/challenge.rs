//! Anti-bot challenge classification
//!
//! Inspects status, headers, and body against signatures of common
//! anti-bot layers. A classified page is archived with its challenge tag
//! and skipped by the extractor pipeline; Cartographer never attempts to
//! solve or bypass a challenge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recognized anti-bot layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeKind {
    Cloudflare,
    Akamai,
    Captcha,
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloudflare => f.write_str("cloudflare"),
            Self::Akamai => f.write_str("akamai"),
            Self::Captcha => f.write_str("captcha"),
        }
    }
}

/// Body markers of a Cloudflare browser-verification interstitial
const CLOUDFLARE_BODY_SIGNATURES: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "challenge-platform",
    "checking your browser before accessing",
    "just a moment...",
];

/// Body markers of an Akamai edge denial
const AKAMAI_BODY_SIGNATURES: &[&str] = &[
    "errors.edgesuite.net",
    "akamai bot manager",
    "reference&#32;&#35;18",
];

/// Generic captcha widgets
const CAPTCHA_BODY_SIGNATURES: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "px-captcha",
    "verify you are human",
];

/// Classify a response against known challenge signatures
///
/// Header checks are cheap and run first; body scans are limited to the
/// leading 64 KB since interstitials are small.
#[must_use]
pub fn classify_challenge(
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
) -> Option<ChallengeKind> {
    let server = headers
        .get("server")
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let mut limit = body.len().min(64 * 1024);
    while limit > 0 && !body.is_char_boundary(limit) {
        limit -= 1;
    }
    let head_lower = body[..limit].to_lowercase();

    if server.contains("cloudflare") && matches!(status, 403 | 503) {
        return Some(ChallengeKind::Cloudflare);
    }
    if CLOUDFLARE_BODY_SIGNATURES.iter().any(|s| head_lower.contains(s)) {
        return Some(ChallengeKind::Cloudflare);
    }

    if server.contains("akamaighost") && matches!(status, 403 | 503) {
        return Some(ChallengeKind::Akamai);
    }
    if AKAMAI_BODY_SIGNATURES.iter().any(|s| head_lower.contains(s)) {
        return Some(ChallengeKind::Akamai);
    }

    // A captcha widget on a 2xx page can be a normal login form; only a
    // blocked status makes it an interstitial.
    if status >= 400 && CAPTCHA_BODY_SIGNATURES.iter().any(|s| head_lower.contains(s)) {
        return Some(ChallengeKind::Captcha);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn cloudflare_by_server_header() {
        let h = headers(&[("server", "cloudflare")]);
        assert_eq!(
            classify_challenge(503, &h, "<html></html>"),
            Some(ChallengeKind::Cloudflare)
        );
        // Ordinary cloudflare-served 200 is not a challenge
        assert_eq!(classify_challenge(200, &h, "<html>ok</html>"), None);
    }

    #[test]
    fn cloudflare_by_body_marker() {
        let body = "<html><title>Just a moment...</title><div id=\"cf-browser-verification\"></div></html>";
        assert_eq!(
            classify_challenge(200, &BTreeMap::new(), body),
            Some(ChallengeKind::Cloudflare)
        );
    }

    #[test]
    fn akamai_denial_page() {
        let body = "<html>Access Denied. See https://errors.edgesuite.net/ for details</html>";
        assert_eq!(
            classify_challenge(403, &BTreeMap::new(), body),
            Some(ChallengeKind::Akamai)
        );
    }

    #[test]
    fn captcha_requires_blocked_status() {
        let body = "<form class=\"g-recaptcha\" data-sitekey=\"x\"></form>";
        assert_eq!(
            classify_challenge(403, &BTreeMap::new(), body),
            Some(ChallengeKind::Captcha)
        );
        assert_eq!(classify_challenge(200, &BTreeMap::new(), body), None);
    }

    #[test]
    fn clean_page_is_unclassified() {
        assert_eq!(
            classify_challenge(200, &BTreeMap::new(), "<html><body>hello</body></html>"),
            None
        );
    }
}
