//! Markdown chunking driven by per-tub settings.
//!
//! A tub's settings select one of three splitters and its parameters:
//!
//! - `markdown` (default): splits along the `#`-heading structure and, when
//!   `chunk_heading_hierarchy` is on, prefixes every chunk with its heading
//!   path so a chunk keeps its place in the document.
//! - `recursive`: recursive character splitting over the configured
//!   separator list.
//! - `token`: fixed token windows using the `cl100k_base` encoding.
//!
//! All splitters are pure and deterministic; empty input yields no chunks.

use crate::model::Headers;
use std::sync::OnceLock;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Errors raised while splitting text.
#[derive(Debug, Error)]
pub enum ChunkerError {
    /// Tokenizer resources could not be initialized or used.
    #[error("tokenizer failure: {0}")]
    Tokenizer(String),
}

/// Which splitting strategy a tub uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitterKind {
    /// Heading-aware Markdown splitting.
    #[default]
    Markdown,
    /// Recursive character splitting over the separator list.
    Recursive,
    /// Fixed `cl100k_base` token windows.
    Token,
}

/// Splitter settings resolved from a tub's settings map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitterConfig {
    /// Selected splitting strategy.
    pub kind: SplitterKind,
    /// Maximum chunk size: characters for `markdown`/`recursive`, tokens
    /// for `token`.
    pub chunk_size: usize,
    /// Overlap carried from the previous chunk, in the same unit.
    pub chunk_overlap: usize,
    /// Separators tried in order by the character splitters.
    pub separators: Vec<String>,
    /// Prefix chunks with their heading path (markdown splitter only).
    pub heading_hierarchy: bool,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            kind: SplitterKind::default(),
            chunk_size: 512,
            chunk_overlap: 0,
            separators: vec!["\n\n".to_string()],
            heading_hierarchy: true,
        }
    }
}

impl SplitterConfig {
    /// Resolve splitter settings from a tub's settings map, falling back to
    /// defaults for missing or unparseable entries.
    pub fn from_settings(settings: &Headers) -> Self {
        let mut config = Self::default();

        let get = |key: &str| settings.get(key).and_then(|v| v.as_deref());

        config.kind = match get("chunk_splitter") {
            Some("token") => SplitterKind::Token,
            Some("recursive") => SplitterKind::Recursive,
            _ => SplitterKind::Markdown,
        };
        if let Some(size) = get("chunk_size").and_then(|v| v.parse().ok()) {
            config.chunk_size = size;
        }
        if let Some(overlap) = get("chunk_overlap").and_then(|v| v.parse().ok()) {
            config.chunk_overlap = overlap;
        }
        if let Some(separators) = get("chunk_separators") {
            config.separators = separators.split(',').map(str::to_string).collect();
        }
        if let Some(flag) = get("chunk_heading_hierarchy") {
            config.heading_hierarchy = flag == "true";
        }
        config
    }

    /// Split Markdown text into ordered chunks according to this config.
    pub fn split(&self, text: &str) -> Result<Vec<String>, ChunkerError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let chunk_size = self.chunk_size.max(1);
        let overlap = self.chunk_overlap.min(chunk_size.saturating_sub(1));
        match self.kind {
            SplitterKind::Recursive => {
                Ok(recursive_split(text, &self.separators, chunk_size, overlap))
            }
            SplitterKind::Markdown => Ok(markdown_split(
                text,
                &self.separators,
                chunk_size,
                overlap,
                self.heading_hierarchy,
            )),
            SplitterKind::Token => token_split(text, chunk_size, overlap),
        }
    }
}

/// Split text on the first applicable separator, recursing into oversized
/// pieces with the remaining separators, then greedily merge pieces back
/// into chunks within the character budget.
fn recursive_split(
    text: &str,
    separators: &[String],
    chunk_size: usize,
    overlap: usize,
) -> Vec<String> {
    let pieces = base_splits(text, separators, chunk_size);
    merge_pieces(pieces, chunk_size, overlap)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn base_splits(text: &str, separators: &[String], chunk_size: usize) -> Vec<String> {
    if char_len(text) <= chunk_size {
        return vec![text.to_string()];
    }

    let chosen = separators
        .iter()
        .position(|sep| !sep.is_empty() && text.contains(sep.as_str()));
    let Some(index) = chosen else {
        return hard_cut(text, chunk_size);
    };

    let separator = &separators[index];
    let mut out = Vec::new();
    for piece in text.split_inclusive(separator.as_str()) {
        if char_len(piece) <= chunk_size {
            out.push(piece.to_string());
        } else {
            out.extend(base_splits(piece, &separators[index + 1..], chunk_size));
        }
    }
    out
}

/// Cut text into windows of at most `chunk_size` characters. Last resort
/// for runs with no usable separator.
fn hard_cut(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|window| window.iter().collect())
        .collect()
}

fn tail_chars(text: &str, count: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(count);
    chars[start..].iter().collect()
}

fn merge_pieces(pieces: Vec<String>, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let flush = |current: &mut String, current_len: &mut usize, chunks: &mut Vec<String>| {
        let chunk = current.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        current.clear();
        *current_len = 0;
    };

    for piece in pieces {
        let piece_len = char_len(&piece);
        if current_len > 0 && current_len + piece_len > chunk_size {
            let tail = if overlap > 0 {
                tail_chars(current.trim_end(), overlap)
            } else {
                String::new()
            };
            flush(&mut current, &mut current_len, &mut chunks);
            if !tail.is_empty() {
                current.push_str(&tail);
                current_len = char_len(&tail);
            }
        }
        current.push_str(&piece);
        current_len += piece_len;
    }
    flush(&mut current, &mut current_len, &mut chunks);
    chunks
}

struct Section {
    heading_path: Vec<String>,
    content: String,
}

/// Split Markdown into heading-delimited sections, then character-split each
/// section's body. Heading detection skips fenced code blocks.
fn markdown_split(
    text: &str,
    separators: &[String],
    chunk_size: usize,
    overlap: usize,
    heading_hierarchy: bool,
) -> Vec<String> {
    let mut sections: Vec<Section> = Vec::new();
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut content = String::new();
    let mut in_fence = false;

    let close_section =
        |heading_stack: &[(usize, String)], content: &mut String, sections: &mut Vec<Section>| {
            if !content.trim().is_empty() {
                sections.push(Section {
                    heading_path: heading_stack.iter().map(|(_, h)| h.clone()).collect(),
                    content: std::mem::take(content),
                });
            } else {
                content.clear();
            }
        };

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading_level = if in_fence { None } else { heading_depth(line) };

        match heading_level {
            Some(level) => {
                close_section(&heading_stack, &mut content, &mut sections);
                while heading_stack.last().is_some_and(|(depth, _)| *depth >= level) {
                    heading_stack.pop();
                }
                heading_stack.push((level, line.trim().to_string()));
            }
            None => {
                content.push_str(line);
                content.push('\n');
            }
        }
    }
    close_section(&heading_stack, &mut content, &mut sections);

    let mut chunks = Vec::new();
    for section in sections {
        let prefix = if heading_hierarchy && !section.heading_path.is_empty() {
            format!("{}\n\n", section.heading_path.join("\n"))
        } else {
            String::new()
        };
        for body in recursive_split(&section.content, separators, chunk_size, overlap) {
            chunks.push(format!("{prefix}{body}"));
        }
    }
    chunks
}

/// The `#` depth of an ATX heading line, if it is one.
fn heading_depth(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) && trimmed.chars().nth(hashes).is_none_or(|c| c == ' ') {
        Some(hashes)
    } else {
        None
    }
}

fn encoding() -> Result<&'static CoreBPE, ChunkerError> {
    static ENCODING: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODING
        .get_or_init(|| cl100k_base().ok())
        .as_ref()
        .ok_or_else(|| ChunkerError::Tokenizer("failed to load cl100k_base encoding".into()))
}

/// Fixed token windows with overlap, decoded back to text.
fn token_split(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>, ChunkerError> {
    let bpe = encoding()?;
    let tokens = bpe.encode_ordinary(text);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let stride = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + chunk_size).min(tokens.len());
        let window = tokens[start..end].to_vec();
        let decoded = bpe
            .decode(window)
            .map_err(|e| ChunkerError::Tokenizer(e.to_string()))?;
        let decoded = decoded.trim();
        if !decoded.is_empty() {
            chunks.push(decoded.to_string());
        }
        if end == tokens.len() {
            break;
        }
        start += stride;
    }
    Ok(chunks)
}
