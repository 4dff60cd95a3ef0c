//! Extractor Pipeline Module
//!
//! Extractors are ordered, named, pure functions over a shared page
//! context. Each returns records destined for specific parts; a failing
//! extractor yields an error record tagged with its name and never
//! disturbs its peers. New extractors register a descriptor rather than
//! subclassing anything.

pub mod assets;
pub mod links;
pub mod seo;

use std::collections::BTreeMap;
use url::Url;

use crate::atlas::records::{AssetRecord, EdgeRecord, ErrorKind, ErrorPhase, ErrorRecord};
use crate::config::FetchMode;
use crate::fetch::NetworkEntry;
use crate::scope::{NormalizeOptions, ScopeClassifier};

/// Everything an extractor may look at. Extractors perform no I/O; the
/// context is the whole world.
pub struct PageContext<'a> {
    pub page_id: &'a str,
    /// Final URL of the page, used as the base for relative links
    pub url: &'a Url,
    pub html: &'a str,
    pub status: u16,
    pub headers: &'a BTreeMap<String, String>,
    pub network_log: &'a [NetworkEntry],
    /// Fetch mode the page was obtained under
    pub mode: FetchMode,
    pub classifier: &'a ScopeClassifier,
    pub normalize_opts: NormalizeOptions,
}

/// Records produced by one extractor
#[derive(Debug, Default)]
pub struct ExtractorOutput {
    pub edges: Vec<EdgeRecord>,
    pub assets: Vec<AssetRecord>,
    /// Rows for auxiliary parts: (part name, record)
    pub aux: Vec<(String, serde_json::Value)>,
}

/// A registered extractor
pub struct ExtractorDescriptor {
    pub name: &'static str,
    /// Part names this extractor may append to, used to pre-register
    /// auxiliary parts with the writer
    pub produced_parts: &'static [&'static str],
    pub run: fn(&PageContext<'_>) -> Result<ExtractorOutput, String>,
}

/// The built-in extractor set, in pipeline order
#[must_use]
pub fn default_extractors() -> Vec<ExtractorDescriptor> {
    vec![
        ExtractorDescriptor {
            name: "links",
            produced_parts: &["edges"],
            run: links::extract,
        },
        ExtractorDescriptor {
            name: "assets",
            produced_parts: &["assets"],
            run: assets::extract,
        },
        ExtractorDescriptor {
            name: "seo",
            produced_parts: &["seo"],
            run: seo::extract,
        },
    ]
}

/// Merged output of a pipeline run
#[derive(Debug, Default)]
pub struct PipelineResult {
    pub edges: Vec<EdgeRecord>,
    pub assets: Vec<AssetRecord>,
    pub aux: Vec<(String, serde_json::Value)>,
    pub errors: Vec<ErrorRecord>,
}

/// Run every extractor against the context, isolating failures
///
/// Outputs are merged in extractor order, so downstream parts observe a
/// deterministic row order for a given page.
#[must_use]
pub fn run_pipeline(extractors: &[ExtractorDescriptor], ctx: &PageContext<'_>) -> PipelineResult {
    let mut result = PipelineResult::default();
    for extractor in extractors {
        match (extractor.run)(ctx) {
            Ok(output) => {
                result.edges.extend(output.edges);
                result.assets.extend(output.assets);
                result.aux.extend(output.aux);
            }
            Err(message) => {
                log::warn!("Extractor '{}' failed on {}: {message}", extractor.name, ctx.url);
                result.errors.push(ErrorRecord::new(
                    ErrorPhase::Extract,
                    ctx.url.as_str(),
                    ErrorKind::ExtractorFailure,
                    format!("{}: {message}", extractor.name),
                    1,
                ));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::normalize;

    fn context<'a>(
        url: &'a Url,
        html: &'a str,
        headers: &'a BTreeMap<String, String>,
        classifier: &'a ScopeClassifier,
    ) -> PageContext<'a> {
        PageContext {
            page_id: "p00000001",
            url,
            html,
            status: 200,
            headers,
            network_log: &[],
            mode: FetchMode::Raw,
            classifier,
            normalize_opts: NormalizeOptions::default(),
        }
    }

    #[test]
    fn failing_extractor_is_isolated() {
        fn boom(_: &PageContext<'_>) -> Result<ExtractorOutput, String> {
            Err("synthetic failure".to_string())
        }
        let extractors = vec![
            ExtractorDescriptor {
                name: "boom",
                produced_parts: &[],
                run: boom,
            },
            ExtractorDescriptor {
                name: "links",
                produced_parts: &["edges"],
                run: links::extract,
            },
        ];

        let url = normalize(None, "https://site.test/a", NormalizeOptions::default()).unwrap();
        let classifier = ScopeClassifier::new(std::slice::from_ref(&url), &[]);
        let headers = BTreeMap::new();
        let html = r#"<a href="/b">next</a>"#;
        let ctx = context(&url, html, &headers, &classifier);

        let result = run_pipeline(&extractors, &ctx);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::ExtractorFailure);
        assert!(result.errors[0].message.contains("boom"));
        assert_eq!(result.edges.len(), 1, "peer extractor still ran");
    }
}
