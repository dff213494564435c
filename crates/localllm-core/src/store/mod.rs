//! Persistence abstraction for localllm.
//!
//! The [`Persistence`] trait covers the durable writes made at well-defined
//! completion points: a document's chunk set after indexing, and a chat
//! message once it is complete. Nothing is written mid-stream.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChatMessage, IndexedChunk, StoredDocument};

/// Durable storage backend for chunks and chat messages.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_chunks`](Persistence::upsert_chunks) | Replace the chunk set of a document |
/// | [`delete_chunks`](Persistence::delete_chunks) | Remove all chunks of a document |
/// | [`clear_chunks`](Persistence::clear_chunks) | Remove every chunk |
/// | [`load_chunks`](Persistence::load_chunks) | Load all documents for index restore |
/// | [`upsert_message`](Persistence::upsert_message) | Insert or update a chat message |
/// | [`delete_message`](Persistence::delete_message) | Remove a chat message |
/// | [`list_messages`](Persistence::list_messages) | Messages of a conversation, oldest first |
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Replace every stored chunk of `document_id` with `chunks`, atomically.
    async fn upsert_chunks(
        &self,
        document_id: &str,
        file_name: &str,
        chunks: &[IndexedChunk],
    ) -> Result<()>;

    /// Delete all chunks of a document. No-op if absent.
    async fn delete_chunks(&self, document_id: &str) -> Result<()>;

    /// Delete every chunk of every document.
    async fn clear_chunks(&self) -> Result<()>;

    /// Load all stored documents with their chunks ordered by ordinal.
    async fn load_chunks(&self) -> Result<Vec<StoredDocument>>;

    /// Insert or replace a chat message by id.
    async fn upsert_message(&self, message: &ChatMessage) -> Result<()>;

    /// Delete a chat message by id. No-op if absent.
    async fn delete_message(&self, id: &str) -> Result<()>;

    /// All messages of a conversation ordered by creation time.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
}
