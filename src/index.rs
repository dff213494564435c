//! Chunk index with similarity search.
//!
//! The index holds an immutable snapshot (`document id → chunks`) behind an
//! `Arc`. Readers clone the `Arc` and score against it without holding any
//! lock, so a search running during indexing sees either the old or the new
//! chunk set of a document, never a mix.
//!
//! Writers are serialized by an async mutex and follow replace-then-publish:
//!
//! 1. Chunk the document and compute every representation.
//! 2. Persist the full chunk set (replacing the previous one).
//! 3. Swap a new snapshot in with the document's entry replaced.
//!
//! A failure or cancellation before step 3 leaves the index exactly as it
//! was. Progress is published on a `watch` channel as [`IndexingState`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use localllm_core::chunk::{chunk_text, reconstruct};
use localllm_core::context::fallback_excerpt;
use localllm_core::embedding::Embedder;
use localllm_core::models::{Document, DocumentSummary, IndexedChunk, SearchResult};
use localllm_core::search::rank;
use localllm_core::store::Persistence;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::cancel::CancelFlag;
use crate::config::ChunkingConfig;
use crate::error::IndexError;

/// Observable indexing status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexingState {
    Idle,
    Indexing {
        current_chunk: usize,
        total_chunks: usize,
        progress: f32,
    },
    Ready,
    Error {
        message: String,
    },
}

#[derive(Debug)]
struct IndexedDocument {
    file_name: String,
    chunks: Vec<IndexedChunk>,
}

type Snapshot = HashMap<String, Arc<IndexedDocument>>;

pub struct Index {
    embedder: Arc<dyn Embedder>,
    persistence: Arc<dyn Persistence>,
    chunking: ChunkingConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
    state_tx: watch::Sender<IndexingState>,
}

impl Index {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        persistence: Arc<dyn Persistence>,
        chunking: ChunkingConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(IndexingState::Idle);
        Self {
            embedder,
            persistence,
            chunking,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
            state_tx,
        }
    }

    /// Current indexing state.
    pub fn state(&self) -> IndexingState {
        self.state_tx.borrow().clone()
    }

    /// Live stream of indexing state changes.
    pub fn subscribe(&self) -> watch::Receiver<IndexingState> {
        self.state_tx.subscribe()
    }

    /// Reload the snapshot from persistence. Returns the document count.
    pub async fn restore(&self) -> Result<usize, IndexError> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .persistence
            .load_chunks()
            .await
            .map_err(|e| IndexError::Persistence(e.to_string()))?;

        let mut next = Snapshot::new();
        for doc in stored {
            next.insert(
                doc.document_id,
                Arc::new(IndexedDocument {
                    file_name: doc.file_name,
                    chunks: doc.chunks,
                }),
            );
        }
        let count = next.len();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        self.set_state(if count > 0 {
            IndexingState::Ready
        } else {
            IndexingState::Idle
        });
        tracing::info!(documents = count, "restored index from persistence");
        Ok(count)
    }

    /// Index (or re-index) a document. Returns the number of chunks.
    pub async fn index_document(&self, document: &Document) -> Result<usize, IndexError> {
        self.index_document_with_cancel(document, &CancelFlag::new())
            .await
    }

    /// Like [`index_document`](Self::index_document), checking `cancel`
    /// between chunks.
    pub async fn index_document_with_cancel(
        &self,
        document: &Document,
        cancel: &CancelFlag,
    ) -> Result<usize, IndexError> {
        let _guard = self.write_lock.lock().await;
        let prior_state = self.state();

        let chunks = match chunk_text(
            &document.id,
            &document.content,
            self.chunking.window_chars,
            self.chunking.overlap_chars,
        ) {
            Ok(chunks) => chunks,
            Err(e) => return Err(self.fail(e.into())),
        };
        let total = chunks.len();
        tracing::info!(
            document_id = %document.id,
            file_name = %document.file_name,
            chunks = total,
            "indexing document"
        );
        self.set_state(IndexingState::Indexing {
            current_chunk: 0,
            total_chunks: total,
            progress: 0.0,
        });

        let mut indexed = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(document_id = %document.id, "indexing cancelled");
                self.set_state(prior_state);
                return Err(IndexError::Cancelled);
            }
            let representation = match self.embedder.represent(&chunk.content).await {
                Ok(r) => r,
                Err(e) => return Err(self.fail(IndexError::EmbeddingFailed(e.to_string()))),
            };
            indexed.push(IndexedChunk {
                chunk,
                representation,
            });
            self.set_state(IndexingState::Indexing {
                current_chunk: i + 1,
                total_chunks: total,
                progress: (i + 1) as f32 / total as f32,
            });
        }

        if cancel.is_cancelled() {
            self.set_state(prior_state);
            return Err(IndexError::Cancelled);
        }

        if let Err(e) = self
            .persistence
            .upsert_chunks(&document.id, &document.file_name, &indexed)
            .await
        {
            return Err(self.fail(IndexError::Persistence(e.to_string())));
        }

        let entry = Arc::new(IndexedDocument {
            file_name: document.file_name.clone(),
            chunks: indexed,
        });
        self.publish(|snapshot| {
            snapshot.insert(document.id.clone(), entry);
        });
        self.set_state(IndexingState::Ready);
        Ok(total)
    }

    /// Top-K chunks scoring at least `threshold` against `query`.
    ///
    /// An empty index or blank query yields an empty result without
    /// touching the embedder.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let snapshot = self.current();
        if snapshot.is_empty() || query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query_rep = self
            .embedder
            .represent(query)
            .await
            .map_err(|e| IndexError::EmbeddingFailed(e.to_string()))?;

        let candidates: Vec<SearchResult> = snapshot
            .values()
            .flat_map(|doc| doc.chunks.iter())
            .filter_map(|indexed| {
                let score = self
                    .embedder
                    .similarity(&query_rep, &indexed.representation);
                (score >= threshold).then(|| SearchResult {
                    chunk: indexed.chunk.clone(),
                    score,
                })
            })
            .collect();

        let results = rank(candidates, top_k, threshold);
        tracing::debug!(query, hits = results.len(), "index search");
        Ok(results)
    }

    /// Remove every chunk of a document. No-op if absent.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        self.persistence
            .delete_chunks(document_id)
            .await
            .map_err(|e| IndexError::Persistence(e.to_string()))?;
        if self.current().contains_key(document_id) {
            self.publish(|snapshot| {
                snapshot.remove(document_id);
            });
            tracing::info!(document_id, "deleted document from index");
        }
        Ok(())
    }

    /// Empty the index and reset state to `Idle`.
    pub async fn clear_all(&self) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        self.persistence
            .clear_chunks()
            .await
            .map_err(|e| IndexError::Persistence(e.to_string()))?;
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(HashMap::new());
        self.set_state(IndexingState::Idle);
        tracing::info!("cleared index");
        Ok(())
    }

    /// Indexed documents, sorted by file name then id.
    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        let mut docs: Vec<DocumentSummary> = self
            .current()
            .iter()
            .map(|(id, doc)| DocumentSummary {
                document_id: id.clone(),
                file_name: doc.file_name.clone(),
                chunk_count: doc.chunks.len(),
            })
            .collect();
        docs.sort_by(|a, b| {
            a.file_name
                .cmp(&b.file_name)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        docs
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.current().values().map(|d| d.chunks.len()).sum()
    }

    /// First `max_chars` characters of a document, rebuilt from its chunks.
    pub fn document_excerpt(&self, document_id: &str, max_chars: usize) -> Option<String> {
        let snapshot = self.current();
        let doc = snapshot.get(document_id)?;
        let chunks: Vec<_> = doc.chunks.iter().map(|c| c.chunk.clone()).collect();
        let text = reconstruct(&chunks);
        let excerpt = fallback_excerpt(&text, max_chars);
        (!excerpt.is_empty()).then_some(excerpt)
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn publish(&self, update: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        update(&mut next);
        *guard = Arc::new(next);
    }

    fn set_state(&self, state: IndexingState) {
        self.state_tx.send_replace(state);
    }

    fn fail(&self, err: IndexError) -> IndexError {
        tracing::warn!(error = %err, "indexing failed");
        self.set_state(IndexingState::Error {
            message: err.to_string(),
        });
        err
    }
}
