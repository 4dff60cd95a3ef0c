//! Link extraction: one edge record per outgoing anchor

use scraper::{Html, Selector};

use crate::atlas::records::{EdgeRecord, LinkRel};
use crate::scope::{Scope, normalize};

use super::{ExtractorOutput, PageContext};

/// Extract `<a href>` edges from the document
///
/// Targets are recorded pre-normalization exactly as written; the
/// normalized form and scope classification ride alongside so the
/// scheduler can enqueue without re-parsing the document.
pub fn extract(ctx: &PageContext<'_>) -> Result<ExtractorOutput, String> {
    let selector = Selector::parse("a[href]").map_err(|e| format!("anchor selector: {e}"))?;
    let document = Html::parse_document(ctx.html);

    let mut output = ExtractorOutput::default();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }

        let rel = parse_rel(anchor.value().attr("rel").unwrap_or_default());
        let text = collapse_whitespace(&anchor.text().collect::<String>());

        let (normalized_target, internal) =
            match normalize(Some(ctx.url), href, ctx.normalize_opts) {
                Ok(target) => {
                    let internal = ctx.classifier.classify(&target) == Scope::Internal;
                    (Some(target.to_string()), internal)
                }
                Err(_) => (None, false),
            };

        output.edges.push(EdgeRecord {
            source_page: ctx.page_id.to_string(),
            target_url: href.to_string(),
            normalized_target,
            text,
            rel,
            internal,
            discovery: ctx.mode,
        });
    }
    Ok(output)
}

fn parse_rel(rel: &str) -> LinkRel {
    let mut parsed = LinkRel::default();
    for token in rel.split_whitespace() {
        match token.to_lowercase().as_str() {
            "nofollow" => parsed.nofollow = true,
            "sponsored" => parsed.sponsored = true,
            "ugc" => parsed.ugc = true,
            _ => {}
        }
    }
    parsed
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{NormalizeOptions, ScopeClassifier};
    use std::collections::BTreeMap;

    #[test]
    fn extracts_edges_with_rel_and_scope() {
        let url = normalize(None, "https://site.test/docs/", NormalizeOptions::default()).unwrap();
        let classifier = ScopeClassifier::new(std::slice::from_ref(&url), &[]);
        let headers = BTreeMap::new();
        let html = r##"
            <a href="page.html">  Next
              page </a>
            <a href="https://other.test/x" rel="nofollow sponsored">out</a>
            <a href="#frag">skip</a>
            <a href="mailto:x@site.test">mail</a>
        "##;
        let ctx = PageContext {
            page_id: "p00000001",
            url: &url,
            html,
            status: 200,
            headers: &headers,
            network_log: &[],
            mode: crate::config::FetchMode::Raw,
            classifier: &classifier,
            normalize_opts: NormalizeOptions::default(),
        };

        let output = extract(&ctx).expect("extract");
        assert_eq!(output.edges.len(), 3);

        let relative = &output.edges[0];
        assert_eq!(
            relative.normalized_target.as_deref(),
            Some("https://site.test/docs/page.html")
        );
        assert!(relative.internal);
        assert_eq!(relative.text, "Next page");

        let external = &output.edges[1];
        assert!(!external.internal);
        assert!(external.rel.nofollow);
        assert!(external.rel.sponsored);
        assert!(!external.rel.ugc);

        // mailto keeps its raw target but cannot be normalized
        let mail = &output.edges[2];
        assert_eq!(mail.normalized_target, None);
        assert!(!mail.internal);
    }
}
