//! Layered-separator text chunker with overlap.
//!
//! Splits extracted page text into [`Chunk`]s no longer than `chunk_size`
//! characters, preferring paragraph boundaries (`\n\n`), then line
//! boundaries, then whitespace, then raw character positions. Consecutive
//! chunks repeat `overlap` trailing characters of context so retrieval
//! still works across chunk boundaries.
//!
//! Each chunk receives a UUID plus a SHA-256 hash of its text for
//! staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split order: paragraph, line, word, then hard character boundaries.
const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// Split `pages` into chunk texts of at most `chunk_size` characters with
/// `overlap` characters of repeated trailing context between consecutive
/// chunks. Pages are joined with a paragraph break before splitting.
///
/// `overlap` must be smaller than `chunk_size` (enforced at config load).
pub fn split_pages(pages: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    split_text(&pages.join("\n\n"), chunk_size, overlap)
}

/// Split a single text. See [`split_pages`].
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let pieces = atomic_pieces(text, chunk_size, SEPARATORS);

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Characters at the head of `current` carried over from the previous
    // chunk. Never flushed on their own.
    let mut seed_chars = 0usize;

    for piece in pieces {
        let piece_chars = piece.chars().count();

        if char_len(&current) + piece_chars > chunk_size {
            if char_len(&current) > seed_chars {
                flush(&mut chunks, &current);
                current = tail_chars(&current, overlap);
                seed_chars = char_len(&current);
            }
            // The seed alone may still not leave room; shrink it.
            if seed_chars + piece_chars > chunk_size {
                let keep = chunk_size.saturating_sub(piece_chars);
                current = tail_chars(&current, keep);
                seed_chars = char_len(&current);
            }
        }

        current.push_str(&piece);
    }

    if char_len(&current) > seed_chars || chunks.is_empty() {
        flush(&mut chunks, &current);
    }

    chunks
}

/// Build [`Chunk`] records for a document from its extracted pages.
pub fn chunk_pages(
    document_id: &str,
    pages: &[String],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    split_pages(pages, chunk_size, overlap)
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(document_id, i as i64, &text))
        .collect()
}

/// Recursively break `text` into pieces no longer than `max_chars`,
/// trying each separator in order. Separators stay attached to the
/// preceding piece so concatenation reconstructs the original text.
fn atomic_pieces(text: &str, max_chars: usize, separators: &[&str]) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let Some((sep, rest)) = separators.split_first() else {
        // Out of separators: hard split at character boundaries.
        let chars: Vec<char> = text.chars().collect();
        return chars
            .chunks(max_chars)
            .map(|w| w.iter().collect())
            .collect();
    };

    let mut out = Vec::new();
    for piece in split_inclusive_str(text, sep) {
        if char_len(&piece) <= max_chars {
            out.push(piece);
        } else {
            out.extend(atomic_pieces(&piece, max_chars, rest));
        }
    }
    out
}

/// Split on `sep`, keeping the separator at the end of each piece.
fn split_inclusive_str(text: &str, sep: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(sep) {
        let end = pos + sep.len();
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

fn flush(chunks: &mut Vec<String>, current: &str) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> String {
    let total = char_len(s);
    s.chars().skip(total.saturating_sub(n)).collect()
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
