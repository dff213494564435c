//! Context assembly under a character budget.
//!
//! Turns ranked [`SearchResult`]s into the single context string that is
//! prepended to the user's question. Whole chunks only: assembly stops at
//! the first chunk that would push the total past the budget.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::models::SearchResult;

/// Separator placed between consecutive chunks.
pub const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

/// Concatenate chunk contents in score order within `budget` characters.
///
/// Duplicate chunks (same id or same content) are emitted once. If no
/// chunk fits, `fallback` is returned truncated to the budget; with no
/// fallback the result is `None`.
///
/// # Example
///
/// ```rust
/// use localllm_core::context::assemble;
///
/// assert_eq!(assemble(&[], 100, Some("raw document text")), Some("raw document text".to_string()));
/// assert_eq!(assemble(&[], 100, None), None);
/// ```
pub fn assemble(results: &[SearchResult], budget: usize, fallback: Option<&str>) -> Option<String> {
    let mut ordered: Vec<&SearchResult> = results.iter().collect();
    ordered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let delimiter_len = CONTEXT_DELIMITER.chars().count();
    let mut seen_ids = HashSet::new();
    let mut seen_content = HashSet::new();
    let mut out = String::new();
    let mut used = 0usize;

    for result in ordered {
        let content = result.chunk.content.as_str();
        if content.trim().is_empty() {
            continue;
        }
        if !seen_ids.insert(result.chunk.id.as_str()) || !seen_content.insert(content) {
            continue;
        }

        let len = content.chars().count();
        let needed = if out.is_empty() { len } else { len + delimiter_len };
        if used + needed > budget {
            break;
        }

        if !out.is_empty() {
            out.push_str(CONTEXT_DELIMITER);
        }
        out.push_str(content);
        used += needed;
    }

    if !out.is_empty() {
        return Some(out);
    }

    fallback
        .map(|text| truncate_chars(text, budget))
        .filter(|text| !text.trim().is_empty())
}

/// The first `n` characters of a document's text.
pub fn fallback_excerpt(text: &str, n: usize) -> String {
    truncate_chars(text, n)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
