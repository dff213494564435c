//! In-memory [`Persistence`] implementation for tests and ephemeral sessions.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Nothing survives the process.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{ChatMessage, IndexedChunk, StoredDocument};

use super::Persistence;

/// In-memory store.
pub struct InMemoryPersistence {
    documents: RwLock<HashMap<String, StoredDocument>>,
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored chunks across all documents.
    pub fn chunk_count(&self) -> usize {
        self.documents
            .read()
            .map(|docs| docs.values().map(|d| d.chunks.len()).sum())
            .unwrap_or(0)
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn upsert_chunks(
        &self,
        document_id: &str,
        file_name: &str,
        chunks: &[IndexedChunk],
    ) -> Result<()> {
        let mut sorted = chunks.to_vec();
        sorted.sort_by_key(|c| c.chunk.ordinal);
        write(&self.documents)?.insert(
            document_id.to_string(),
            StoredDocument {
                document_id: document_id.to_string(),
                file_name: file_name.to_string(),
                chunks: sorted,
            },
        );
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        write(&self.documents)?.remove(document_id);
        Ok(())
    }

    async fn clear_chunks(&self) -> Result<()> {
        write(&self.documents)?.clear();
        Ok(())
    }

    async fn load_chunks(&self) -> Result<Vec<StoredDocument>> {
        let mut docs: Vec<StoredDocument> = read(&self.documents)?.values().cloned().collect();
        docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(docs)
    }

    async fn upsert_message(&self, message: &ChatMessage) -> Result<()> {
        let mut messages = write(&self.messages)?;
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        write(&self.messages)?.retain(|m| m.id != id);
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let mut out: Vec<ChatMessage> = read(&self.messages)?
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }
}
