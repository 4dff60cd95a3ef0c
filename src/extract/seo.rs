//! SEO metadata extraction into the auxiliary `seo` part

use scraper::{Html, Selector};
use serde_json::json;

use super::{ExtractorOutput, PageContext};

fn select_first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

fn select_first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(ToString::to_string)
}

/// One `seo` row per page: title, description, canonical, robots meta,
/// Open Graph basics, heading counts.
pub fn extract(ctx: &PageContext<'_>) -> Result<ExtractorOutput, String> {
    let parse = |s: &str| Selector::parse(s).map_err(|e| format!("seo selector: {e}"));

    let title_sel = parse("title")?;
    let description_sel = parse("meta[name=\"description\"]")?;
    let canonical_sel = parse("link[rel=\"canonical\"]")?;
    let robots_sel = parse("meta[name=\"robots\"]")?;
    let og_title_sel = parse("meta[property=\"og:title\"]")?;
    let h1_sel = parse("h1")?;

    let document = Html::parse_document(ctx.html);

    let record = json!({
        "page": ctx.page_id,
        "url": ctx.url.as_str(),
        "title": select_first_text(&document, &title_sel),
        "metaDescription": select_first_attr(&document, &description_sel, "content"),
        "canonical": select_first_attr(&document, &canonical_sel, "href"),
        "robotsMeta": select_first_attr(&document, &robots_sel, "content"),
        "ogTitle": select_first_attr(&document, &og_title_sel, "content"),
        "h1Count": document.select(&h1_sel).count(),
    });

    let mut output = ExtractorOutput::default();
    output.aux.push(("seo".to_string(), record));
    Ok(output)
}
