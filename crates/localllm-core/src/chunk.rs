//! Overlapping-window text chunker.
//!
//! Splits normalized document text into [`Chunk`]s of at most `window`
//! characters. Consecutive chunks share exactly `overlap` characters so that
//! a sentence cut by one window edge is still whole in the neighbouring
//! chunk.
//!
//! # Algorithm
//!
//! 1. Normalize the text ([`normalize_text`]): unify line endings, strip
//!    trailing whitespace per line, collapse runs of blank lines, trim.
//! 2. Starting at character 0, take a window of `window` characters.
//! 3. Unless the window reaches the end of the text, snap its end back to
//!    the last sentence terminator, or failing that the last whitespace, in
//!    the back part of the window. With neither, cut hard.
//! 4. Start the next window `overlap` characters before the previous end.
//! 5. Stop once a window reaches the end of the text.
//!
//! Offsets are in characters, never bytes, so multi-byte UTF-8 text is
//! never split inside a code point.
//!
//! # Example
//!
//! ```rust
//! use localllm_core::chunk::{chunk_text, reconstruct, normalize_text};
//!
//! let text = "Hello world. This is a short note.";
//! let chunks = chunk_text("doc-1", text, 1000, 200).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(reconstruct(&chunks), normalize_text(text));
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("document is empty after normalization")]
    EmptyDocument,
    #[error("invalid chunk window: window={window}, overlap={overlap} (need window > 0 and overlap < window)")]
    InvalidWindow { window: usize, overlap: usize },
}

/// Normalize raw decoded text before chunking.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

/// Split `text` into overlapping windows.
///
/// # Guarantees
///
/// - At least one chunk is returned; every chunk is non-empty.
/// - Ordinals are contiguous: `0, 1, …, N-1`.
/// - `chunks[i + 1].start == chunks[i].end - overlap`.
/// - [`reconstruct`] of the result equals [`normalize_text`] of the input.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    window: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    if window == 0 || overlap >= window {
        return Err(ChunkError::InvalidWindow { window, overlap });
    }

    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return Err(ChunkError::EmptyDocument);
    }

    let chars: Vec<char> = normalized.chars().collect();
    let offsets: Vec<usize> = normalized
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(normalized.len()))
        .collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + window).min(total);
        let end = if hard_end == total {
            total
        } else {
            snap_window_end(&chars, start, hard_end, window, overlap)
        };

        let content = &normalized[offsets[start]..offsets[end]];
        chunks.push(make_chunk(document_id, chunks.len(), content, start, end));

        if end == total {
            break;
        }
        start = end - overlap;
    }

    Ok(chunks)
}

/// Rebuild the normalized text from a chunk sequence by dropping overlaps.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.start);
        out.extend(chunk.content.chars().skip(skip));
        covered = chunk.end;
    }
    out
}

/// Pick the end of a window that does not reach the end of the text.
///
/// The result is always greater than `start + overlap`, so the next
/// window makes progress.
fn snap_window_end(
    chars: &[char],
    start: usize,
    hard_end: usize,
    window: usize,
    overlap: usize,
) -> usize {
    let floor = start + (window / 2).max(overlap);
    let candidates = || (floor + 1..=hard_end).rev();

    candidates()
        .find(|&p| matches!(chars[p - 1], '.' | '!' | '?' | '\n'))
        .or_else(|| candidates().find(|&p| chars[p - 1].is_whitespace()))
        .unwrap_or(hard_end)
}

fn make_chunk(document_id: &str, ordinal: usize, content: &str, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, ordinal).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        ordinal,
        content: content.to_string(),
        start,
        end,
        hash,
    }
}
