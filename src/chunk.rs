//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s no longer than `max_chars`,
//! breaking on blank lines first and falling back to newline or space
//! boundaries inside oversized paragraphs.
//!
//! Chunk ids are derived from the origin entity and the chunk index, so
//! re-reading an unchanged file yields the same ids and an UPSERT sync
//! replaces rather than duplicates.

use sha2::{Digest, Sha256};

/// One piece of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable id: hex SHA-256 of `entity` and `index`.
    pub id: String,
    pub index: usize,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into chunks of at most `max_chars` bytes. Indices are
/// contiguous from 0 and at least one chunk is always returned.
pub fn chunk_text(entity: &str, text: &str, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            pieces.extend(hard_split(trimmed, max_chars));
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| make_chunk(entity, index, piece))
        .collect()
}

/// Split an oversized paragraph, preferring newline then space boundaries.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            out.push(remaining.trim().to_string());
            break;
        }
        let limit = floor_char_boundary(remaining, max_chars);
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit.max(next_char_len(remaining)));
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
    out
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn next_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(0)
}

fn hex_sha256(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn make_chunk(entity: &str, index: usize, text: String) -> Chunk {
    let index_str = index.to_string();
    Chunk {
        id: hex_sha256(&[entity.as_bytes(), b"#", index_str.as_bytes()]),
        index,
        hash: hex_sha256(&[text.as_bytes()]),
        text,
    }
}
