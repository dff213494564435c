//! Similarity representations, the [`Embedder`] trait, and scoring helpers.
//!
//! A [`Representation`] is either a dense embedding vector or a sparse
//! term-frequency signature. Both compare through one [`similarity`]
//! function returning a score in `[0.0, 1.0]`, so the index does not care
//! which backend produced them.
//!
//! Concrete model-backed embedders (fastembed) live in the `localllm` app
//! crate. [`KeywordEmbedder`] lives here because it is pure.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The comparable form of a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Representation {
    Dense(Vec<f32>),
    Terms(TermSignature),
}

impl Representation {
    pub fn kind(&self) -> &'static str {
        match self {
            Representation::Dense(_) => "dense",
            Representation::Terms(_) => "terms",
        }
    }
}

/// Sparse bag-of-words signature: lowercase term → occurrence count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSignature(pub BTreeMap<String, u32>);

impl TermSignature {
    pub fn from_text(text: &str) -> Self {
        let mut terms = BTreeMap::new();
        for term in tokenize(text) {
            *terms.entry(term).or_insert(0) += 1;
        }
        Self(terms)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it", "its",
    "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with",
];

/// Lowercased alphanumeric terms of at least two characters, minus stopwords.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

/// Trait for similarity backends.
///
/// `represent` may be slow (model inference) and is async; `similarity`
/// is pure and called once per stored chunk per query.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the backend identifier (e.g. `"keyword"`, `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;

    /// Compute the representation of `text`.
    async fn represent(&self, text: &str) -> Result<Representation>;

    /// Score two representations in `[0.0, 1.0]`.
    fn similarity(&self, a: &Representation, b: &Representation) -> f64 {
        similarity(a, b)
    }
}

/// Term-frequency embedder. No model, no I/O.
#[derive(Debug, Clone, Default)]
pub struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    async fn represent(&self, text: &str) -> Result<Representation> {
        Ok(Representation::Terms(TermSignature::from_text(text)))
    }
}

/// Uniform similarity over any two representations.
///
/// Dense vectors use cosine similarity clamped to `[0, 1]` (opposite
/// directions count as unrelated). Term signatures use cosine over their
/// term-frequency vectors. Mixed kinds never match.
pub fn similarity(a: &Representation, b: &Representation) -> f64 {
    let score = match (a, b) {
        (Representation::Dense(x), Representation::Dense(y)) => cosine_similarity(x, y) as f64,
        (Representation::Terms(x), Representation::Terms(y)) => term_cosine(x, y),
        _ => 0.0,
    };
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn term_cosine(a: &TermSignature, b: &TermSignature) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.0.len() <= b.0.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .0
        .iter()
        .filter_map(|(term, &n)| large.0.get(term).map(|&m| n as f64 * m as f64))
        .sum();
    let norm = |s: &TermSignature| s.0.values().map(|&n| (n as f64).powi(2)).sum::<f64>().sqrt();
    dot / (norm(a) * norm(b))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use localllm_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
