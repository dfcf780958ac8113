use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::selector::stable_selector;
use crate::types::{
    AriaRegion, ContentBlock, ContentExtraction, ExtractError, ExtractErrorKind, ExtractedTable,
    Heading, normalize_whitespace,
};

#[derive(Debug, Clone)]
pub struct ContentOptions {
    pub min_paragraph_chars: usize,
    /// Upper bound on `cleaned_text` length, in bytes.
    pub max_text_bytes: usize,
    pub preserve_whitespace: bool,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            min_paragraph_chars: 30,
            max_text_bytes: 500_000,
            preserve_whitespace: false,
        }
    }
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

const INVISIBLE_TAGS: [&str; 5] = ["script", "style", "noscript", "template", "head"];

fn element_visible(el: &ElementRef) -> bool {
    let value = el.value();
    if INVISIBLE_TAGS.contains(&value.name()) {
        return false;
    }
    if value.attr("hidden").is_some() {
        return false;
    }
    if value.attr("aria-hidden") == Some("true") {
        return false;
    }
    if let Some(style) = value.attr("style") {
        let squashed: String = style.chars().filter(|c| !c.is_whitespace()).collect();
        if squashed.contains("display:none") || squashed.contains("visibility:hidden") {
            return false;
        }
    }
    true
}

/// Visible to the user: the element and every ancestor pass the check.
fn visible_with_ancestors(el: &ElementRef) -> bool {
    if !element_visible(el) {
        return false;
    }
    let mut current = el.parent();
    while let Some(node) = current {
        if let Some(parent) = ElementRef::wrap(node) {
            if !element_visible(&parent) {
                return false;
            }
            current = parent.parent();
        } else {
            break;
        }
    }
    true
}

fn collect_visible_text(el: ElementRef, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if child.value().is_element() {
            if let Some(child_el) = ElementRef::wrap(child) {
                if element_visible(&child_el) {
                    collect_visible_text(child_el, out);
                }
            }
        }
    }
}

fn visible_text(el: ElementRef, preserve_whitespace: bool) -> String {
    let mut out = String::new();
    collect_visible_text(el, &mut out);
    if preserve_whitespace {
        out.trim().to_string()
    } else {
        normalize_whitespace(&out)
    }
}

/// Extract typed content from one HTML page. Pure: the same
/// `(html, url, options)` always yields the same result.
pub fn extract_content(html: &str, canonical_url: &str, options: &ContentOptions) -> ContentExtraction {
    let doc = Html::parse_document(html);
    let mut errors = Vec::new();

    let title = doc
        .select(&sel("title"))
        .next()
        .map(|t| normalize_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .or_else(|| meta_content(&doc, "meta[property=\"og:title\"]"));

    let description = meta_content(&doc, "meta[name=\"description\"]")
        .or_else(|| meta_content(&doc, "meta[property=\"og:description\"]"));

    let canonical = doc
        .select(&sel("link[rel=\"canonical\"]"))
        .next()
        .and_then(|l| l.value().attr("href"))
        .and_then(|href| match Url::parse(canonical_url) {
            Ok(base) => base.join(href).ok().map(|u| u.to_string()),
            Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
        })
        .unwrap_or_else(|| canonical_url.to_string());
    if Url::parse(&canonical).is_err() {
        errors.push(ExtractError::new(
            ExtractErrorKind::Html,
            format!("unparseable canonical url: {canonical}"),
        ));
    }

    let language = doc
        .select(&sel("html"))
        .next()
        .and_then(|h| h.value().attr("lang"))
        .map(|l| l.to_string())
        .or_else(|| meta_content(&doc, "meta[http-equiv=\"content-language\"]"));

    let mut headings = Vec::new();
    let mut blocks = Vec::new();
    let mut paragraphs = Vec::new();
    for el in doc.select(&sel("h1, h2, h3, h4, h5, h6, p, li")) {
        if !visible_with_ancestors(&el) {
            continue;
        }
        let tag = el.value().name();
        let text = visible_text(el, false);
        if text.is_empty() {
            continue;
        }
        if let Some(level) = tag.strip_prefix('h').and_then(|l| l.parse::<u8>().ok()) {
            headings.push(Heading {
                level,
                text: text.clone(),
                anchor: el.value().attr("id").map(|a| a.to_string()),
            });
            blocks.push(ContentBlock::Heading { level, text });
        } else if text.chars().count() >= options.min_paragraph_chars {
            // Skip list items nested in another captured li to avoid
            // double-counting.
            if tag == "li" && has_li_ancestor(&el) {
                continue;
            }
            paragraphs.push(text.clone());
            blocks.push(ContentBlock::Paragraph {
                text,
                selector: stable_selector(&el),
            });
        }
    }

    let tables = doc
        .select(&sel("table"))
        .filter(|t| visible_with_ancestors(t))
        .map(extract_table)
        .collect();

    let regions = extract_regions(&doc);

    let mut cleaned_text = doc
        .select(&sel("body"))
        .next()
        .map(|body| visible_text(body, options.preserve_whitespace))
        .unwrap_or_default();
    if cleaned_text.len() > options.max_text_bytes {
        let mut cut = options.max_text_bytes;
        while cut > 0 && !cleaned_text.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned_text.truncate(cut);
    }

    ContentExtraction {
        title,
        description,
        canonical_url: canonical,
        language,
        headings,
        paragraphs,
        tables,
        regions,
        blocks,
        cleaned_text,
        errors,
        extracted_at: Utc::now(),
    }
}

fn meta_content(doc: &Html, css: &str) -> Option<String> {
    doc.select(&sel(css))
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|c| normalize_whitespace(c))
        .filter(|c| !c.is_empty())
}

fn has_li_ancestor(el: &ElementRef) -> bool {
    let mut current = el.parent();
    while let Some(node) = current {
        if let Some(parent) = ElementRef::wrap(node) {
            if parent.value().name() == "li" {
                return true;
            }
            current = parent.parent();
        } else {
            break;
        }
    }
    false
}

fn extract_table(table: ElementRef) -> ExtractedTable {
    let caption = table
        .select(&sel("caption"))
        .next()
        .map(|c| normalize_whitespace(&c.text().collect::<String>()));

    let mut headers: Vec<String> = table
        .select(&sel("thead th"))
        .map(|th| normalize_whitespace(&th.text().collect::<String>()))
        .collect();

    let mut rows = Vec::new();
    for tr in table.select(&sel("tr")) {
        let header_cells: Vec<String> = tr
            .select(&sel("th"))
            .map(|c| normalize_whitespace(&c.text().collect::<String>()))
            .collect();
        let data_cells: Vec<String> = tr
            .select(&sel("td"))
            .map(|c| normalize_whitespace(&c.text().collect::<String>()))
            .collect();
        if headers.is_empty() && !header_cells.is_empty() && data_cells.is_empty() {
            headers = header_cells;
        } else if !data_cells.is_empty() {
            rows.push(data_cells);
        }
    }

    ExtractedTable {
        caption,
        headers,
        rows,
    }
}

/// ARIA landmark regions, either explicit `role` attributes or the
/// equivalent semantic tags.
fn extract_regions(doc: &Html) -> Vec<AriaRegion> {
    let mut regions = Vec::new();
    for el in doc.select(&sel("[role], main, nav, aside, header, footer, form, section[aria-label]")) {
        if !visible_with_ancestors(&el) {
            continue;
        }
        let role = el
            .value()
            .attr("role")
            .map(|r| r.to_string())
            .unwrap_or_else(|| implicit_role(el.value().name()).to_string());
        if role.is_empty() {
            continue;
        }
        let content = visible_text(el, false);
        if content.is_empty() {
            continue;
        }
        let mut truncated = content;
        if truncated.len() > 2000 {
            let mut cut = 2000;
            while cut > 0 && !truncated.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated.truncate(cut);
        }
        regions.push(AriaRegion {
            role,
            label: el.value().attr("aria-label").map(|l| l.to_string()),
            content: truncated,
            selector: stable_selector(&el),
        });
    }
    regions
}

fn implicit_role(tag: &str) -> &'static str {
    match tag {
        "main" => "main",
        "nav" => "navigation",
        "aside" => "complementary",
        "header" => "banner",
        "footer" => "contentinfo",
        "form" => "form",
        "section" => "region",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <title>Acme Widgets | Home</title>
  <meta name="description" content="The best widgets in town">
  <link rel="canonical" href="/home">
  <style>.x { color: red }</style>
  <script>var tracked = true;</script>
</head>
<body>
  <header><h1 id="top">Acme Widgets</h1></header>
  <main role="main">
    <h2>Our refund policy</h2>
    <p>We offer a thirty day money back guarantee on every widget purchase.</p>
    <p>tiny</p>
    <p style="display:none">Hidden promotional text that should never appear.</p>
    <table>
      <caption>Prices</caption>
      <tr><th>Model</th><th>Price</th></tr>
      <tr><td>Basic</td><td>$10</td></tr>
    </table>
  </main>
  <footer aria-label="Site footer"><p>Contact us at any time for assistance with orders.</p></footer>
</body>
</html>"#;

    #[test]
    fn extracts_title_description_language() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        assert_eq!(result.title.as_deref(), Some("Acme Widgets | Home"));
        assert_eq!(result.description.as_deref(), Some("The best widgets in town"));
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.canonical_url, "https://acme.test/home");
    }

    #[test]
    fn heading_hierarchy_is_captured() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        let levels: Vec<u8> = result.headings.iter().map(|h| h.level).collect();
        assert_eq!(levels, vec![1, 2]);
        assert_eq!(result.headings[0].anchor.as_deref(), Some("top"));
    }

    #[test]
    fn short_and_hidden_paragraphs_are_dropped() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        assert_eq!(result.paragraphs.len(), 2);
        assert!(result.paragraphs[0].contains("thirty day money back"));
        assert!(!result.cleaned_text.contains("Hidden promotional text"));
        assert!(!result.cleaned_text.contains("var tracked"));
    }

    #[test]
    fn tables_are_structured() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        assert_eq!(result.tables.len(), 1);
        let table = &result.tables[0];
        assert_eq!(table.caption.as_deref(), Some("Prices"));
        assert_eq!(table.headers, vec!["Model", "Price"]);
        assert_eq!(table.rows, vec![vec!["Basic", "$10"]]);
    }

    #[test]
    fn aria_regions_cover_landmarks() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        let roles: Vec<&str> = result.regions.iter().map(|r| r.role.as_str()).collect();
        assert!(roles.contains(&"main"));
        assert!(roles.contains(&"banner"));
        assert!(roles.contains(&"contentinfo"));
        let footer = result.regions.iter().find(|r| r.role == "contentinfo").unwrap();
        assert_eq!(footer.label.as_deref(), Some("Site footer"));
    }

    #[test]
    fn cleaned_text_is_bounded() {
        let options = ContentOptions {
            max_text_bytes: 40,
            ..ContentOptions::default()
        };
        let result = extract_content(PAGE, "https://acme.test/", &options);
        assert!(result.cleaned_text.len() <= 40);
    }

    #[test]
    fn blocks_preserve_document_order() {
        let result = extract_content(PAGE, "https://acme.test/", &ContentOptions::default());
        match &result.blocks[0] {
            ContentBlock::Heading { level, .. } => assert_eq!(*level, 1),
            other => panic!("expected heading first, got {other:?}"),
        }
    }
}
