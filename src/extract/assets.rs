//! Asset extraction: sub-resources referenced by a page
//!
//! Document references (`img`, `script`, `link rel=stylesheet`, media
//! elements) are unioned with the network log, which carries transfer
//! sizes in browser modes. Deduped by URL, document order first.

use scraper::{Html, Selector};
use std::collections::HashSet;

use crate::atlas::records::{AssetKind, AssetRecord};
use crate::scope::normalize;

use super::{ExtractorOutput, PageContext};

const TAG_SELECTORS: &[(&str, AssetKind)] = &[
    ("img[src]", AssetKind::Image),
    ("script[src]", AssetKind::Script),
    ("link[rel=\"stylesheet\"][href]", AssetKind::Style),
    ("video[src], audio[src], source[src]", AssetKind::Media),
];

pub fn extract(ctx: &PageContext<'_>) -> Result<ExtractorOutput, String> {
    let document = Html::parse_document(ctx.html);
    let mut output = ExtractorOutput::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (selector_str, kind) in TAG_SELECTORS {
        let selector =
            Selector::parse(selector_str).map_err(|e| format!("asset selector: {e}"))?;
        for element in document.select(&selector) {
            let Some(reference) = element
                .value()
                .attr("src")
                .or_else(|| element.value().attr("href"))
            else {
                continue;
            };
            let Ok(resolved) = normalize(Some(ctx.url), reference, ctx.normalize_opts) else {
                continue;
            };
            let url = resolved.to_string();
            if !seen.insert(url.clone()) {
                continue;
            }
            let size = ctx
                .network_log
                .iter()
                .find(|entry| entry.url == url)
                .and_then(|entry| entry.bytes);
            output.assets.push(AssetRecord {
                page: ctx.page_id.to_string(),
                url,
                kind: *kind,
                size,
                content_hash: None,
            });
        }
    }

    // Network-observed sub-requests the document does not reference
    // directly (fonts, XHR-loaded media).
    for entry in ctx.network_log {
        let kind = match entry.resource_type.as_str() {
            "image" => AssetKind::Image,
            "script" => AssetKind::Script,
            "stylesheet" => AssetKind::Style,
            "media" | "font" => AssetKind::Media,
            "document" => continue,
            _ => AssetKind::Other,
        };
        if !seen.insert(entry.url.clone()) {
            continue;
        }
        output.assets.push(AssetRecord {
            page: ctx.page_id.to_string(),
            url: entry.url.clone(),
            kind,
            size: entry.bytes,
            content_hash: None,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NetworkEntry;
    use crate::scope::{NormalizeOptions, ScopeClassifier};
    use std::collections::BTreeMap;

    #[test]
    fn assets_union_document_and_network_log() {
        let url = normalize(None, "https://site.test/", NormalizeOptions::default()).unwrap();
        let classifier = ScopeClassifier::new(std::slice::from_ref(&url), &[]);
        let headers = BTreeMap::new();
        let html = r#"
            <img src="/logo.png">
            <script src="/app.js"></script>
            <link rel="stylesheet" href="/site.css">
        "#;
        let network_log = vec![
            NetworkEntry {
                url: "https://site.test/logo.png".to_string(),
                resource_type: "image".to_string(),
                status: Some(200),
                bytes: Some(512),
            },
            NetworkEntry {
                url: "https://cdn.test/font.woff2".to_string(),
                resource_type: "font".to_string(),
                status: Some(200),
                bytes: Some(2048),
            },
        ];
        let ctx = PageContext {
            page_id: "p00000001",
            url: &url,
            html,
            status: 200,
            headers: &headers,
            network_log: &network_log,
            mode: crate::config::FetchMode::Raw,
            classifier: &classifier,
            normalize_opts: NormalizeOptions::default(),
        };

        let output = extract(&ctx).expect("extract");
        assert_eq!(output.assets.len(), 4);

        let logo = output
            .assets
            .iter()
            .find(|a| a.url.ends_with("logo.png"))
            .expect("logo present");
        assert_eq!(logo.kind, AssetKind::Image);
        assert_eq!(logo.size, Some(512), "size joined from network log");

        let font = output
            .assets
            .iter()
            .find(|a| a.url.ends_with("font.woff2"))
            .expect("font present");
        assert_eq!(font.kind, AssetKind::Media);
    }
}
