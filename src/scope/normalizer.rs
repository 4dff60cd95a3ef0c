//! Deterministic URL normalization and scope classification
//!
//! Normalization is the dedup key for the whole crawl, so it must be
//! idempotent: `normalize(normalize(u)) == normalize(u)`.
//!
//! # Normalization Steps
//!
//! 1. Resolve relative references against the discovering page
//! 2. Parse; reject malformed URLs and non-http(s) schemes
//! 3. Lowercase scheme and host (the `url` crate guarantees both)
//! 4. Strip default ports
//! 5. Decode unreserved percent-encodings in the path
//! 6. Preserve case in path and query
//! 7. Sort query parameters only when `normalize_query_order` is set
//! 8. Drop the fragment

use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Errors produced while normalizing a candidate URL
#[derive(Debug, Clone, Error)]
pub enum NormalizeError {
    #[error("failed to parse URL: {0}")]
    Parse(String),
    #[error("unsupported scheme '{0}', only http and https are crawled")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Options controlling normalization, derived from the crawl config
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    /// Sort query parameters byte-wise when set
    pub sort_query: bool,
}

/// Normalize a raw URL reference, optionally resolving it against a base
///
/// # Arguments
/// * `base` - Page the reference was discovered on, for relative links
/// * `raw` - The reference exactly as written
/// * `opts` - Normalization options
pub fn normalize(
    base: Option<&Url>,
    raw: &str,
    opts: NormalizeOptions,
) -> Result<Url, NormalizeError> {
    let mut url = match base {
        Some(base) => base
            .join(raw.trim())
            .map_err(|e| NormalizeError::Parse(e.to_string()))?,
        None => Url::parse(raw.trim()).map_err(|e| NormalizeError::Parse(e.to_string()))?,
    };

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(NormalizeError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none() {
        return Err(NormalizeError::MissingHost);
    }

    // The url crate already lowercases scheme/host and drops default ports
    // from the serialization; what remains is ours.
    let path = decode_unreserved(url.path());
    url.set_path(&path);

    if opts.sort_query
        && let Some(query) = url.query()
    {
        let mut pairs: Vec<&str> = query.split('&').collect();
        pairs.sort_unstable();
        let sorted = pairs.join("&");
        url.set_query(Some(&sorted));
    }

    url.set_fragment(None);

    // Decoding can surface new dot segments (`%2E%2E` becomes `..`); a
    // re-parse settles the path so the result is a fixpoint.
    Url::parse(url.as_str()).map_err(|e| NormalizeError::Parse(e.to_string()))
}

/// Decode percent-encodings of unreserved characters (RFC 3986 §2.3)
///
/// `%41` becomes `A`, but reserved or non-ASCII encodings are preserved
/// exactly, uppercased hex included, so the transform is idempotent.
fn decode_unreserved(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(value) = u8::from_str_radix(hex, 16) {
                let ch = value as char;
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_' | '~') {
                    out.push(ch);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Registrable-domain approximation used for scope decisions
///
/// Strips a single leading `www.` label; subdomain matching is handled by
/// the classifier.
#[must_use]
pub fn registrable_domain(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Scope decision for a normalized URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Registrable domain matches a seed; eligible for the frontier
    Internal,
    /// Off-site; recorded as an edge, enqueued only with `follow_external`
    External,
    /// Matched an exclusion pattern; never enqueued, filter is deterministic
    Excluded,
}

/// Classifies URLs against the seed-host set and exclusion patterns
#[derive(Debug, Clone)]
pub struct ScopeClassifier {
    seed_domains: HashSet<String>,
    excluded: Vec<regex::Regex>,
}

impl ScopeClassifier {
    /// Build a classifier from parsed seed URLs
    #[must_use]
    pub fn new(seeds: &[Url], excluded: &[regex::Regex]) -> Self {
        let seed_domains = seeds
            .iter()
            .filter_map(|u| u.host_str())
            .map(|h| registrable_domain(h).to_string())
            .collect();
        Self {
            seed_domains,
            excluded: excluded.to_vec(),
        }
    }

    /// Classify a normalized URL
    #[must_use]
    pub fn classify(&self, url: &Url) -> Scope {
        let as_str = url.as_str();
        if self.excluded.iter().any(|re| re.is_match(as_str)) {
            return Scope::Excluded;
        }
        if self.is_internal_host(url.host_str().unwrap_or_default()) {
            Scope::Internal
        } else {
            Scope::External
        }
    }

    fn is_internal_host(&self, host: &str) -> bool {
        let domain = registrable_domain(host);
        self.seed_domains.iter().any(|seed| {
            domain == seed || domain.ends_with(&format!(".{seed}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> Url {
        normalize(None, raw, NormalizeOptions::default()).expect("normalize")
    }

    #[test]
    fn lowercases_host_not_path() {
        let url = norm("HTTP://EXAMPLE.COM/Some/Path?Key=Value");
        assert_eq!(url.as_str(), "http://example.com/Some/Path?Key=Value");
    }

    #[test]
    fn strips_default_port_and_fragment() {
        let url = norm("https://example.com:443/a#section");
        assert_eq!(url.as_str(), "https://example.com/a");
        let url = norm("http://example.com:8080/a");
        assert_eq!(url.as_str(), "http://example.com:8080/a");
    }

    #[test]
    fn decodes_unreserved_encodings_only() {
        let url = norm("https://example.com/%41bc%2Fdef%7E");
        assert_eq!(url.path(), "/Abc%2Fdef~");
    }

    #[test]
    fn resolves_relative_references() {
        let base = norm("https://example.com/docs/index.html");
        let url = normalize(Some(&base), "../about", NormalizeOptions::default())
            .expect("normalize relative");
        assert_eq!(url.as_str(), "https://example.com/about");
    }

    #[test]
    fn query_sorting_is_opt_in() {
        let url = norm("https://example.com/p?b=2&a=1");
        assert_eq!(url.query(), Some("b=2&a=1"));
        let sorted = normalize(
            None,
            "https://example.com/p?b=2&a=1",
            NormalizeOptions { sort_query: true },
        )
        .expect("normalize");
        assert_eq!(sorted.query(), Some("a=1&b=2"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        let result = normalize(None, "ftp://example.com/x", NormalizeOptions::default());
        assert!(matches!(result, Err(NormalizeError::UnsupportedScheme(_))));
        let result = normalize(None, "mailto:someone@example.com", NormalizeOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "HTTP://EXAMPLE.COM:80/%41/B%2F?z=1&a=2#f",
            "https://www.example.com/a/../b",
            "https://example.com",
        ] {
            let once = norm(raw);
            let twice = norm(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn classifier_subdomains_are_internal() {
        let seeds = vec![norm("https://www.example.com/")];
        let classifier = ScopeClassifier::new(&seeds, &[]);
        assert_eq!(classifier.classify(&norm("https://example.com/a")), Scope::Internal);
        assert_eq!(
            classifier.classify(&norm("https://docs.example.com/a")),
            Scope::Internal
        );
        assert_eq!(classifier.classify(&norm("https://other.org/")), Scope::External);
        // Suffix tricks are not subdomains
        assert_eq!(
            classifier.classify(&norm("https://notexample.com/")),
            Scope::External
        );
    }

    #[test]
    fn classifier_exclusions_win() {
        let seeds = vec![norm("https://example.com/")];
        let re = regex::Regex::new("^https://example\\.com/private/.*$").expect("regex");
        let classifier = ScopeClassifier::new(&seeds, &[re]);
        assert_eq!(
            classifier.classify(&norm("https://example.com/private/x")),
            Scope::Excluded
        );
    }
}
