use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sitekb_common::{ActionKind, RiskLevel, SideEffect};

/// Extraction failures are non-fatal: each sub-extractor carries its own
/// error list and a partial result is always better than none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractErrorKind {
    Html,
    JsonLd,
    Action,
    Form,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractError {
    pub kind: ExtractErrorKind,
    pub detail: String,
}

impl ExtractError {
    pub fn new(kind: ExtractErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub caption: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AriaRegion {
    pub role: String,
    pub label: Option<String>,
    pub content: String,
    pub selector: String,
}

/// Document-ordered content stream used by the chunker to prefer heading
/// boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentBlock {
    Heading { level: u8, text: String },
    Paragraph { text: String, selector: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentExtraction {
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: String,
    pub language: Option<String>,
    pub headings: Vec<Heading>,
    pub paragraphs: Vec<String>,
    pub tables: Vec<ExtractedTable>,
    pub regions: Vec<AriaRegion>,
    pub blocks: Vec<ContentBlock>,
    pub cleaned_text: String,
    pub errors: Vec<ExtractError>,
    pub extracted_at: DateTime<Utc>,
}

/// A structured entity before it is attached to a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDraft {
    pub entity_type: String,
    pub properties: serde_json::Value,
    pub confidence: f32,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLdExtraction {
    pub entities: Vec<EntityDraft>,
    pub errors: Vec<ExtractError>,
    pub extracted_at: DateTime<Utc>,
}

/// An interactive element before manifest compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDraft {
    pub name: String,
    pub kind: ActionKind,
    pub description: String,
    pub selector: String,
    pub text: String,
    pub category: Option<String>,
    pub side_effecting: SideEffect,
    pub risk_level: RiskLevel,
    pub requires_confirmation: bool,
    pub requires_auth: bool,
    pub source_url: String,
    /// Navigation target, when the element is a link.
    pub href: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExtraction {
    pub actions: Vec<ActionDraft>,
    pub errors: Vec<ExtractError>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormKind {
    Contact,
    Search,
    Newsletter,
    Login,
    Registration,
    Checkout,
    Booking,
    Feedback,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub field_type: String,
    pub label: Option<String>,
    pub required: bool,
    pub disabled: bool,
    pub readonly: bool,
    pub pattern: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
    pub min_length: Option<u32>,
    pub max_length: Option<u32>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedForm {
    pub selector: String,
    pub action: Option<String>,
    pub method: String,
    pub kind: FormKind,
    pub name: Option<String>,
    pub fields: Vec<FormField>,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormExtraction {
    pub forms: Vec<ExtractedForm>,
    pub errors: Vec<ExtractError>,
    pub extracted_at: DateTime<Utc>,
}

/// Aggregate of every sub-extractor over one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    pub content: ContentExtraction,
    pub jsonld: JsonLdExtraction,
    pub actions: ActionExtraction,
    pub forms: FormExtraction,
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex-encoded SHA-256, the canonical content hash everywhere.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(normalize_whitespace("a\n\n  b\tc "), "a b c");
        assert_eq!(normalize_whitespace(""), "");
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        let hash = content_hash("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash("hello"));
        assert_ne!(hash, content_hash("world"));
    }
}
