//! Core data models used throughout localllm.
//!
//! These types represent the documents, chunks, search results, and chat
//! messages that flow through the ingestion, retrieval, and generation
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::Representation;

/// A decoded source file, ready for chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub content: String,
    pub page_count: usize,
    pub word_count: usize,
    pub char_count: usize,
}

impl Document {
    /// Build a document from plain text, deriving word and char counts.
    pub fn from_text(
        id: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<String>,
        page_count: usize,
    ) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            file_name: file_name.into(),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            page_count,
            content,
        }
    }
}

/// A window of a document's normalized text.
///
/// `start` and `end` are character offsets into the normalized text;
/// consecutive chunks overlap where `next.start < prev.end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub content: String,
    pub start: usize,
    pub end: usize,
    pub hash: String,
}

/// A chunk together with the representation used to score it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub representation: Representation,
}

/// A chunk returned from a query, with its similarity score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f64,
}

/// Per-document listing entry exposed by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub file_name: String,
    pub chunk_count: usize,
}

/// Chunks for one document as loaded back from persistence.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document_id: String,
    pub file_name: String,
    pub chunks: Vec<IndexedChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A single chat turn.
///
/// Assistant messages are created with `is_complete = false` and grow while
/// tokens stream in; once complete they are persisted and never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub is_complete: bool,
    pub tokens_generated: usize,
    pub generation_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// A finished message authored by the user (or system).
    pub fn new(conversation_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            is_complete: true,
            tokens_generated: 0,
            generation_time_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// An empty assistant message that will be filled by streaming.
    pub fn streaming(conversation_id: &str) -> Self {
        Self {
            is_complete: false,
            ..Self::new(conversation_id, Role::Assistant, String::new())
        }
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
}

fn default_max_tokens() -> usize {
    512
}
fn default_temperature() -> f32 {
    0.8
}
fn default_top_p() -> f32 {
    0.95
}
fn default_top_k() -> i32 {
    40
}
fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_counts() {
        let doc = Document::from_text("d1", "a.txt", "héllo wide  world", 1);
        assert_eq!(doc.word_count, 3);
        assert_eq!(doc.char_count, 17);
    }

    #[test]
    fn test_role_roundtrip_str() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_streaming_message_starts_incomplete() {
        let msg = ChatMessage::streaming("conv");
        assert_eq!(msg.role, Role::Assistant);
        assert!(!msg.is_complete);
        assert!(msg.content.is_empty());
    }

    #[test]
    fn test_generation_config_partial_toml_defaults() {
        let cfg: GenerationConfig = serde_json::from_str(r#"{"max_tokens": 5}"#).unwrap();
        assert_eq!(cfg.max_tokens, 5);
        assert_eq!(cfg.top_k, 40);
        assert!((cfg.top_p - 0.95).abs() < f32::EPSILON);
    }
}
