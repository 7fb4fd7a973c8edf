//! Text chunking and snippet helpers.

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ChunkingConfig;

/// Splits source text into overlapping pieces.
///
/// Implementations must cover the input in order and return at least one
/// entry, even for empty input (the entry may itself be empty).
pub trait Chunker: Send + Sync {
    fn chunk(&self, text: &str, options: &ChunkingConfig) -> Vec<String>;
}

/// Sliding-window chunker that prefers to cut at sentence boundaries.
///
/// Windows are `chunk_size` characters long. When a sentence ends in the
/// second half of a window the cut moves back to that sentence end. The next
/// window starts `overlap` characters before the cut.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentenceChunker;

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str, options: &ChunkingConfig) -> Vec<String> {
        chunk_text(text, options.chunk_size, options.overlap)
    }
}

#[must_use]
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    // Byte offset of every char, plus the end of the string.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = offsets.len() - 1;

    let sentence_ends: Vec<usize> = text
        .split_sentence_bound_indices()
        .map(|(idx, sentence)| idx + sentence.len())
        .filter_map(|byte_end| offsets.binary_search(&byte_end).ok())
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < char_len {
        let mut end = (start + chunk_size).min(char_len);
        if end < char_len {
            let earliest = start + chunk_size / 2;
            if let Some(&cut) = sentence_ends
                .iter()
                .rev()
                .find(|&&cut| cut > earliest && cut <= end)
            {
                end = cut;
            }
        }

        let piece = text[offsets[start]..offsets[end]].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= char_len {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }
    chunks
}

/// First `max_chars` characters of `text`.
#[must_use]
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
