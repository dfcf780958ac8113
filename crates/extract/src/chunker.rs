use serde::{Deserialize, Serialize};

use sitekb_common::embedding::estimate_tokens;

use crate::types::{content_hash, normalize_whitespace, ContentBlock, ContentExtraction};

#[derive(Debug, Clone)]
pub struct ChunkerOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
        }
    }
}

/// A chunk before persistence: no ids yet, indexes monotone from 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub chunk_index: i32,
    pub content: String,
    pub cleaned_content: String,
    pub content_hash: String,
    pub token_count: i32,
    pub section: Option<String>,
    pub heading: Option<String>,
    pub selector: Option<String>,
}

struct ChunkBuilder {
    options: ChunkerOptions,
    drafts: Vec<ChunkDraft>,
    buffer: Vec<String>,
    buffer_tokens: usize,
    section: Option<String>,
    heading: Option<String>,
    selector: Option<String>,
}

impl ChunkBuilder {
    fn new(options: ChunkerOptions) -> Self {
        Self {
            options,
            drafts: Vec::new(),
            buffer: Vec::new(),
            buffer_tokens: 0,
            section: None,
            heading: None,
            selector: None,
        }
    }

    fn flush(&mut self, carry_overlap: bool) {
        if self.buffer.is_empty() {
            return;
        }
        let content = self.buffer.join("\n\n");
        let cleaned = normalize_whitespace(&content);
        let draft = ChunkDraft {
            chunk_index: self.drafts.len() as i32,
            content_hash: content_hash(&cleaned),
            token_count: estimate_tokens(&cleaned) as i32,
            content,
            cleaned_content: cleaned,
            section: self.section.clone(),
            heading: self.heading.clone(),
            selector: self.selector.clone(),
        };
        self.drafts.push(draft);

        let overlap = if carry_overlap && self.options.overlap_tokens > 0 {
            tail_words(self.buffer.last().map(String::as_str).unwrap_or(""), self.options.overlap_tokens)
        } else {
            None
        };
        self.buffer.clear();
        self.buffer_tokens = 0;
        self.selector = None;
        if let Some(tail) = overlap {
            self.buffer_tokens = estimate_tokens(&tail) as usize;
            self.buffer.push(tail);
        }
    }

    fn push_paragraph(&mut self, text: &str, selector: &str) {
        let tokens = estimate_tokens(text) as usize;

        // A single oversized paragraph is split on word boundaries.
        if tokens > self.options.max_tokens {
            self.flush(false);
            for piece in split_words(text, self.options.max_tokens) {
                self.buffer.push(piece);
                self.selector.get_or_insert_with(|| selector.to_string());
                self.flush(true);
            }
            return;
        }

        if self.buffer_tokens + tokens > self.options.max_tokens {
            self.flush(true);
        }
        if self.selector.is_none() {
            self.selector = Some(selector.to_string());
        }
        self.buffer.push(text.to_string());
        self.buffer_tokens += tokens;
    }

    fn push_heading(&mut self, level: u8, text: &str) {
        // Heading boundaries are preferred break points: a reasonably full
        // buffer flushes instead of straddling the heading.
        if self.buffer_tokens * 2 >= self.options.max_tokens {
            self.flush(false);
        }
        if level <= 2 {
            self.section = Some(text.to_string());
        }
        self.heading = Some(text.to_string());
    }
}

fn tail_words(text: &str, max_tokens: usize) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }
    let mut taken = Vec::new();
    let mut tokens = 0usize;
    for word in words.iter().rev() {
        let t = estimate_tokens(word) as usize + 1;
        if tokens + t > max_tokens {
            break;
        }
        tokens += t;
        taken.push(*word);
    }
    if taken.is_empty() {
        return None;
    }
    taken.reverse();
    Some(taken.join(" "))
}

fn split_words(text: &str, max_tokens: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = Vec::new();
    let mut tokens = 0usize;
    for word in text.split_whitespace() {
        let t = estimate_tokens(word) as usize + 1;
        if tokens + t > max_tokens && !current.is_empty() {
            pieces.push(current.join(" "));
            current.clear();
            tokens = 0;
        }
        tokens += t;
        current.push(word);
    }
    if !current.is_empty() {
        pieces.push(current.join(" "));
    }
    pieces
}

/// Chunk extracted content into token-bounded fragments with overlap.
/// Boundaries prefer heading breaks; `chunk_index` is monotone within the
/// document.
pub fn chunk_content(content: &ContentExtraction, options: &ChunkerOptions) -> Vec<ChunkDraft> {
    let mut builder = ChunkBuilder::new(options.clone());
    for block in &content.blocks {
        match block {
            ContentBlock::Heading { level, text } => builder.push_heading(*level, text),
            ContentBlock::Paragraph { text, selector } => builder.push_paragraph(text, selector),
        }
    }
    builder.flush(false);
    builder.drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn extraction(blocks: Vec<ContentBlock>) -> ContentExtraction {
        ContentExtraction {
            title: None,
            description: None,
            canonical_url: "https://acme.test/".to_string(),
            language: None,
            headings: Vec::new(),
            paragraphs: Vec::new(),
            tables: Vec::new(),
            regions: Vec::new(),
            blocks,
            cleaned_text: String::new(),
            errors: Vec::new(),
            extracted_at: Utc::now(),
        }
    }

    fn paragraph(text: &str) -> ContentBlock {
        ContentBlock::Paragraph {
            text: text.to_string(),
            selector: "p:nth-child(1)".to_string(),
        }
    }

    #[test]
    fn indexes_are_monotone_from_zero() {
        let long = "word ".repeat(300);
        let content = extraction(vec![paragraph(&long), paragraph(&long), paragraph(&long)]);
        let chunks = chunk_content(&content, &ChunkerOptions { max_tokens: 200, overlap_tokens: 20 });
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i32);
            assert!(chunk.token_count <= 260, "chunk {} too large", i);
        }
    }

    #[test]
    fn heading_sets_section_and_heading() {
        let content = extraction(vec![
            ContentBlock::Heading { level: 1, text: "Store".to_string() },
            ContentBlock::Heading { level: 3, text: "Refunds".to_string() },
            paragraph("Our refund policy is generous and applies to all purchases made online."),
        ]);
        let chunks = chunk_content(&content, &ChunkerOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section.as_deref(), Some("Store"));
        assert_eq!(chunks[0].heading.as_deref(), Some("Refunds"));
    }

    #[test]
    fn heading_break_is_preferred() {
        let filler = "alpha beta gamma delta ".repeat(30);
        let content = extraction(vec![
            ContentBlock::Heading { level: 2, text: "First".to_string() },
            paragraph(&filler),
            ContentBlock::Heading { level: 2, text: "Second".to_string() },
            paragraph(&filler),
        ]);
        let chunks = chunk_content(&content, &ChunkerOptions { max_tokens: 300, overlap_tokens: 0 });
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading.as_deref(), Some("First"));
        assert_eq!(chunks[1].heading.as_deref(), Some("Second"));
    }

    #[test]
    fn overlap_repeats_trailing_words() {
        let first = "one two three four five six seven eight nine ten ".repeat(20);
        let content = extraction(vec![paragraph(&first), paragraph(&first)]);
        let chunks = chunk_content(&content, &ChunkerOptions { max_tokens: 120, overlap_tokens: 10 });
        assert!(chunks.len() >= 2);
        let tail_of_first: Vec<&str> = chunks[0].cleaned_content.split_whitespace().rev().take(3).collect();
        for word in tail_of_first {
            assert!(chunks[1].cleaned_content.contains(word));
        }
    }

    #[test]
    fn identical_content_hashes_identically() {
        let content = extraction(vec![paragraph("A stable paragraph about shipping and delivery times.")]);
        let a = chunk_content(&content, &ChunkerOptions::default());
        let b = chunk_content(&content, &ChunkerOptions::default());
        assert_eq!(a[0].content_hash, b[0].content_hash);
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        let content = extraction(vec![]);
        assert!(chunk_content(&content, &ChunkerOptions::default()).is_empty());
    }
}
