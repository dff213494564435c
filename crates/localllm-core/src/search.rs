//! Ranking of scored chunks.
//!
//! The index scores every stored chunk against the query representation
//! and hands the candidates to [`rank`], which applies the threshold,
//! ordering, and top-K cut. Keeping this step pure makes the ordering
//! contract testable without an embedder.
//!
//! # Ordering
//!
//! 1. Drop candidates with `score < threshold` (and NaN scores).
//! 2. Sort by score descending.
//! 3. Break ties by chunk ordinal ascending, then document id, then chunk id.
//! 4. Truncate to `top_k`.

use std::cmp::Ordering;

use crate::models::SearchResult;

/// Filter, order, and truncate candidates.
pub fn rank(mut candidates: Vec<SearchResult>, top_k: usize, threshold: f64) -> Vec<SearchResult> {
    if top_k == 0 {
        return Vec::new();
    }

    candidates.retain(|r| !r.score.is_nan() && r.score >= threshold);
    candidates.sort_by(compare_results);
    candidates.truncate(top_k);
    candidates
}

/// Total order used by [`rank`].
pub fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
        .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}
