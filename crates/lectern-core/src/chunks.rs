//! Splits document text into chunks for embedding and search.
//! Prefers paragraph boundaries; falls back to line breaks, then spaces, then character splits.

use crate::reader::Document;

/// Default maximum characters per chunk.
pub const DEFAULT_MAX_CHARS: usize = 1000;

/// A chunk of text from a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Index of this chunk within the document (0, 1, 2, …).
    pub index: usize,
    pub word_count: usize,
}

/// Chunk a single document's text into smaller pieces.
pub fn chunk_document(doc: &Document, max_chars: usize) -> Vec<Chunk> {
    let body = doc.text.trim();
    if body.is_empty() {
        return Vec::new();
    }
    split_into_chunks(body, max_chars)
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(index, text)| Chunk {
            word_count: text.split_whitespace().count(),
            text,
            index,
        })
        .collect()
}

/// Splits text into chunks of at most max_chars characters, preferring paragraph and line boundaries.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    let mut result = Vec::new();
    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if para.chars().count() <= max_chars {
            result.push(para.to_string());
        } else {
            result.extend(split_long_text(para, max_chars));
        }
    }
    result
}

fn split_long_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            result.push(remaining.trim().to_string());
            break;
        }
        let (chunk, rest) = try_split_at_boundary(remaining, max_chars);
        result.push(chunk);
        remaining = rest;
    }
    result
}

/// Prefer split at \n; else at last space before max_chars; else hard cut.
fn try_split_at_boundary(text: &str, max_chars: usize) -> (String, &str) {
    // byte offset just past max_chars characters (text is longer than that)
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let segment = &text[..limit];
    let split_at = segment
        .rfind('\n')
        .or_else(|| segment.rfind(' '))
        .filter(|&pos| pos > 0);
    match split_at {
        Some(pos) => (text[..pos].trim().to_string(), text[pos + 1..].trim_start()),
        None => (segment.to_string(), text[limit..].trim_start()),
    }
}
