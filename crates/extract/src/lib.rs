//! HTML extraction: typed content, JSON-LD entities, interactive actions,
//! forms, the chunker, and the site manifest generator. Every extractor is
//! a pure function of `(html, canonical_url, options)`.

pub mod actions;
pub mod chunker;
pub mod content;
pub mod forms;
pub mod jsonld;
pub mod manifest;
pub mod pipeline;
pub mod selector;
pub mod types;

pub use actions::extract_actions;
pub use chunker::{chunk_content, ChunkDraft, ChunkerOptions};
pub use content::{extract_content, ContentOptions};
pub use forms::extract_forms;
pub use jsonld::extract_jsonld;
pub use manifest::{build_json_schema, validate_action_args, ManifestGenerator};
pub use pipeline::ExtractorPipeline;
pub use types::*;
