use tracing::{debug, instrument};

use crate::actions::extract_actions;
use crate::content::{extract_content, ContentOptions};
use crate::forms::extract_forms;
use crate::jsonld::extract_jsonld;
use crate::types::PageExtraction;

/// Ordered composition of the sub-extractors. Each one isolates its own
/// failures, so the pipeline always returns a (possibly partial) result.
#[derive(Debug, Clone, Default)]
pub struct ExtractorPipeline {
    content_options: ContentOptions,
}

impl ExtractorPipeline {
    pub fn new(content_options: ContentOptions) -> Self {
        Self { content_options }
    }

    #[instrument(skip(self, html), fields(url = %canonical_url, html_bytes = html.len()))]
    pub fn run(&self, html: &str, canonical_url: &str) -> PageExtraction {
        let content = extract_content(html, canonical_url, &self.content_options);
        let jsonld = extract_jsonld(html);
        let actions = extract_actions(html, canonical_url);
        let forms = extract_forms(html, canonical_url);

        debug!(
            paragraphs = content.paragraphs.len(),
            entities = jsonld.entities.len(),
            actions = actions.actions.len(),
            forms = forms.forms.len(),
            errors = content.errors.len() + jsonld.errors.len() + actions.errors.len() + forms.errors.len(),
            "page extracted"
        );

        PageExtraction {
            content,
            jsonld,
            actions,
            forms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_aggregates_all_extractors() {
        let html = r#"<html lang="en"><head><title>Shop</title>
            <script type="application/ld+json">{"@type":"Product","name":"W","description":"d"}</script>
            </head><body>
            <h1>Shop</h1>
            <p>Welcome to our shop, where every widget comes with a warranty.</p>
            <a href="/cart">View cart</a>
            <form id="nl"><input name="email" type="email"><input type="submit" value="Subscribe to newsletter"></form>
            </body></html>"#;
        let extraction = ExtractorPipeline::default().run(html, "https://shop.test/");

        assert_eq!(extraction.content.title.as_deref(), Some("Shop"));
        assert_eq!(extraction.jsonld.entities.len(), 1);
        assert!(!extraction.actions.actions.is_empty());
        assert_eq!(extraction.forms.forms.len(), 1);
    }

    #[test]
    fn broken_jsonld_still_yields_content() {
        let html = r#"<html><head>
            <script type="application/ld+json">{{{</script>
            </head><body><p>Perfectly good paragraph content that survives bad metadata.</p></body></html>"#;
        let extraction = ExtractorPipeline::default().run(html, "https://shop.test/");
        assert_eq!(extraction.content.paragraphs.len(), 1);
        assert_eq!(extraction.jsonld.errors.len(), 1);
        assert!(extraction.jsonld.entities.is_empty());
    }
}
