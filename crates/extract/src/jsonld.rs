use chrono::Utc;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::types::{EntityDraft, ExtractError, ExtractErrorKind, JsonLdExtraction};

/// Required properties per well-known Schema.org type. Completeness against
/// this table feeds the confidence score.
fn required_properties(entity_type: &str) -> Option<&'static [&'static str]> {
    Some(match entity_type {
        "Product" => &["name", "description"],
        "Article" | "NewsArticle" | "BlogPosting" => &["headline"],
        "Organization" => &["name"],
        "Person" => &["name"],
        "FAQPage" => &["mainEntity"],
        "Event" => &["name", "startDate"],
        "LocalBusiness" => &["name", "address"],
        "BreadcrumbList" => &["itemListElement"],
        "WebSite" => &["name", "url"],
        "Offer" => &["price"],
        "Recipe" => &["name", "recipeIngredient"],
        _ => return None,
    })
}

/// Normalize an `@type` value: arrays collapse to their first entry, URL
/// forms reduce to the trailing segment.
fn normalize_type(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Array(items) => items.first().and_then(|v| v.as_str())?,
        _ => return None,
    };
    let segment = raw.rsplit(['/', '#']).next().unwrap_or(raw);
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn entity_from_object(obj: &serde_json::Map<String, Value>) -> Option<EntityDraft> {
    let entity_type = normalize_type(obj.get("@type")?)?;

    let property_count = obj.keys().filter(|k| !k.starts_with('@')).count();
    let (known, completeness) = match required_properties(&entity_type) {
        Some(required) => {
            let present = required.iter().filter(|p| obj.contains_key(**p)).count();
            (true, present as f32 / required.len() as f32)
        }
        None => (false, (property_count as f32 / 5.0).min(1.0)),
    };
    let confidence = if known {
        0.5 + 0.5 * completeness
    } else {
        0.3 + 0.2 * completeness
    };

    let mut labels = vec![entity_type.to_lowercase()];
    if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
        labels.push(name.to_lowercase());
    }

    Some(EntityDraft {
        entity_type,
        properties: Value::Object(obj.clone()),
        confidence: confidence.clamp(0.0, 1.0),
        labels,
    })
}

fn collect_entities(value: &Value, entities: &mut Vec<EntityDraft>) {
    match value {
        Value::Object(obj) => {
            // `@graph` containers flatten into their members.
            if let Some(Value::Array(graph)) = obj.get("@graph") {
                for member in graph {
                    collect_entities(member, entities);
                }
                return;
            }
            if let Some(entity) = entity_from_object(obj) {
                entities.push(entity);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_entities(item, entities);
            }
        }
        _ => {}
    }
}

/// Scan every `<script type="application/ld+json">` block. A malformed
/// block is recorded and skipped; its siblings still extract.
pub fn extract_jsonld(html: &str) -> JsonLdExtraction {
    let doc = Html::parse_document(html);
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();

    let mut entities = Vec::new();
    let mut errors = Vec::new();
    for (index, block) in doc.select(&selector).enumerate() {
        let raw: String = block.text().collect();
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => collect_entities(&value, &mut entities),
            Err(e) => errors.push(ExtractError::new(
                ExtractErrorKind::JsonLd,
                format!("block {index}: {e}"),
            )),
        }
    }

    JsonLdExtraction {
        entities,
        errors,
        extracted_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_with_all_required_properties_scores_high() {
        let html = r#"<script type="application/ld+json">
            {"@context": "https://schema.org", "@type": "Product",
             "name": "Widget", "description": "A fine widget", "sku": "W-1"}
        </script>"#;
        let result = extract_jsonld(html);
        assert_eq!(result.entities.len(), 1);
        let entity = &result.entities[0];
        assert_eq!(entity.entity_type, "Product");
        assert!(entity.confidence >= 0.99);
        assert!(entity.labels.contains(&"product".to_string()));
        assert!(entity.labels.contains(&"widget".to_string()));
    }

    #[test]
    fn incomplete_product_scores_lower() {
        let html = r#"<script type="application/ld+json">
            {"@type": "Product", "name": "Widget"}
        </script>"#;
        let result = extract_jsonld(html);
        let entity = &result.entities[0];
        assert!((entity.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn graph_arrays_flatten() {
        let html = r#"<script type="application/ld+json">
            {"@context": "https://schema.org", "@graph": [
                {"@type": "Organization", "name": "Acme"},
                {"@type": "WebSite", "name": "Acme Home", "url": "https://acme.test"}
            ]}
        </script>"#;
        let result = extract_jsonld(html);
        let types: Vec<&str> = result.entities.iter().map(|e| e.entity_type.as_str()).collect();
        assert_eq!(types, vec!["Organization", "WebSite"]);
    }

    #[test]
    fn malformed_block_does_not_poison_siblings() {
        let html = r#"
            <script type="application/ld+json">{not json at all</script>
            <script type="application/ld+json">{"@type": "FAQPage", "mainEntity": []}</script>
        "#;
        let result = extract_jsonld(html);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].entity_type, "FAQPage");
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.errors[0].kind, ExtractErrorKind::JsonLd));
    }

    #[test]
    fn type_urls_and_arrays_normalize() {
        assert_eq!(
            normalize_type(&serde_json::json!("https://schema.org/Product")),
            Some("Product".to_string())
        );
        assert_eq!(
            normalize_type(&serde_json::json!(["Offer", "Thing"])),
            Some("Offer".to_string())
        );
        assert_eq!(normalize_type(&serde_json::json!(42)), None);
    }
}
