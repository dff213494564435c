//! Index behaviour over the keyword embedder and in-memory persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use localllm::cancel::CancelFlag;
use localllm::config::ChunkingConfig;
use localllm::error::IndexError;
use localllm::index::{Index, IndexingState};
use localllm_core::embedding::{Embedder, KeywordEmbedder, Representation};
use localllm_core::models::Document;
use localllm_core::store::memory::InMemoryPersistence;

const RUST_NOTES: &str = "Rust ownership moves values between bindings.\n\n\
Borrowing lends references without moving ownership.\n\n\
Python garbage collection frees unused objects.";

fn chunking() -> ChunkingConfig {
    ChunkingConfig {
        window_chars: 60,
        overlap_chars: 0,
    }
}

fn index_with(persistence: Arc<InMemoryPersistence>) -> Index {
    Index::new(Arc::new(KeywordEmbedder), persistence, chunking())
}

fn notes() -> Document {
    Document::from_text("notes", "rust.txt", RUST_NOTES, 1)
}

#[tokio::test]
async fn test_three_chunk_document_top_k_with_threshold() {
    let index = index_with(Arc::new(InMemoryPersistence::new()));
    assert_eq!(index.index_document(&notes()).await.unwrap(), 3);

    let results = index.search("rust ownership borrowing", 2, 0.3).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.score >= 0.3));
    assert!(results[0].score >= results[1].score);
    // Equal scores fall back to document order.
    assert_eq!(results[0].chunk.ordinal, 0);
    assert_eq!(results[1].chunk.ordinal, 1);

    let results = index
        .search("how does ownership work with borrowing references", 2, 0.3)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.ordinal, 1);
}

#[tokio::test]
async fn test_empty_index_search_is_empty() {
    let index = index_with(Arc::new(InMemoryPersistence::new()));
    assert!(index.search("ownership", 5, 0.0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reindex_replaces_previous_chunks() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let index = index_with(Arc::clone(&persistence));
    index.index_document(&notes()).await.unwrap();
    assert_eq!(index.chunk_count(), 3);

    let updated = Document::from_text("notes", "rust.txt", "Lifetimes describe how long references live.", 1);
    assert_eq!(index.index_document(&updated).await.unwrap(), 1);

    assert_eq!(index.chunk_count(), 1);
    assert_eq!(persistence.chunk_count(), 1);
    assert!(index.search("garbage collection", 5, 0.1).await.unwrap().is_empty());
    assert_eq!(index.search("lifetimes", 5, 0.1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_and_clear() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let index = index_with(Arc::clone(&persistence));
    index.index_document(&notes()).await.unwrap();
    index
        .index_document(&Document::from_text("other", "b.txt", "Completely separate text.", 1))
        .await
        .unwrap();
    assert_eq!(index.list_documents().len(), 2);

    index.delete_document("notes").await.unwrap();
    let docs = index.list_documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].document_id, "other");
    assert!(index.search("ownership", 5, 0.1).await.unwrap().is_empty());

    index.clear_all().await.unwrap();
    assert!(index.is_empty());
    assert_eq!(persistence.chunk_count(), 0);
    assert_eq!(index.state(), IndexingState::Idle);
}

#[tokio::test]
async fn test_restore_rebuilds_from_persistence() {
    let persistence = Arc::new(InMemoryPersistence::new());
    index_with(Arc::clone(&persistence))
        .index_document(&notes())
        .await
        .unwrap();

    let restored = index_with(persistence);
    assert_eq!(restored.restore().await.unwrap(), 1);
    assert_eq!(restored.state(), IndexingState::Ready);
    assert_eq!(restored.chunk_count(), 3);
    assert_eq!(restored.search("garbage collection", 1, 0.3).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_state_reports_progress_then_ready() {
    let index = index_with(Arc::new(InMemoryPersistence::new()));
    let rx = index.subscribe();
    index.index_document(&notes()).await.unwrap();
    assert_eq!(*rx.borrow(), IndexingState::Ready);
}

/// Cancels its flag after the first representation.
struct CancellingEmbedder {
    cancel: CancelFlag,
}

#[async_trait]
impl Embedder for CancellingEmbedder {
    fn model_name(&self) -> &str {
        "cancelling"
    }

    async fn represent(&self, text: &str) -> anyhow::Result<Representation> {
        self.cancel.cancel();
        KeywordEmbedder.represent(text).await
    }
}

#[tokio::test]
async fn test_cancel_mid_document_keeps_prior_content() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let cancel = CancelFlag::new();
    let index = Index::new(
        Arc::new(CancellingEmbedder {
            cancel: cancel.clone(),
        }),
        persistence.clone(),
        chunking(),
    );

    let result = index.index_document_with_cancel(&notes(), &cancel).await;
    assert_eq!(result, Err(IndexError::Cancelled));
    assert!(index.is_empty());
    assert_eq!(persistence.chunk_count(), 0);
    assert_eq!(index.state(), IndexingState::Idle);
}

/// Always fails.
struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    async fn represent(&self, _text: &str) -> anyhow::Result<Representation> {
        anyhow::bail!("model missing")
    }
}

#[tokio::test]
async fn test_embedding_failure_sets_error_state() {
    let index = Index::new(
        Arc::new(BrokenEmbedder),
        Arc::new(InMemoryPersistence::new()),
        chunking(),
    );
    let err = index.index_document(&notes()).await.unwrap_err();
    assert!(matches!(err, IndexError::EmbeddingFailed(_)));
    assert!(matches!(index.state(), IndexingState::Error { .. }));
    assert!(index.is_empty());
}

/// Keyword embedder that can be made to fail, to cancel a flag, or to
/// pause before each representation.
#[derive(Default)]
struct SwitchEmbedder {
    fail: AtomicBool,
    cancel_on_use: Mutex<Option<CancelFlag>>,
    delay: Duration,
}

impl SwitchEmbedder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Embedder for SwitchEmbedder {
    fn model_name(&self) -> &str {
        "switch"
    }

    async fn represent(&self, text: &str) -> anyhow::Result<Representation> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("model missing");
        }
        if let Some(cancel) = self.cancel_on_use.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        KeywordEmbedder.represent(text).await
    }
}

#[tokio::test]
async fn test_state_publishes_rising_progress() {
    let index = Arc::new(Index::new(
        Arc::new(SwitchEmbedder::slow(Duration::from_millis(20))),
        Arc::new(InMemoryPersistence::new()),
        chunking(),
    ));
    let mut rx = index.subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let done = state == IndexingState::Ready;
            seen.push(state);
            if done {
                break;
            }
        }
        seen
    });

    index.index_document(&notes()).await.unwrap();
    let seen = watcher.await.unwrap();

    let progress: Vec<(usize, usize, f32)> = seen
        .iter()
        .filter_map(|s| match s {
            IndexingState::Indexing {
                current_chunk,
                total_chunks,
                progress,
            } => Some((*current_chunk, *total_chunks, *progress)),
            _ => None,
        })
        .collect();
    assert!(progress.iter().any(|&(current, _, _)| current >= 1));
    assert!(progress.iter().all(|&(_, total, p)| total == 3 && (0.0..=1.0).contains(&p)));
    assert!(progress.windows(2).all(|w| w[0].2 <= w[1].2));
    assert_eq!(seen.last(), Some(&IndexingState::Ready));
}

#[tokio::test]
async fn test_failed_reindex_keeps_existing_chunks() {
    let embedder = Arc::new(SwitchEmbedder::default());
    let persistence = Arc::new(InMemoryPersistence::new());
    let index = Index::new(embedder.clone(), persistence.clone(), chunking());
    index.index_document(&notes()).await.unwrap();
    let before = index.search("garbage collection", 3, 0.1).await.unwrap();
    assert_eq!(before.len(), 1);

    embedder.fail.store(true, Ordering::SeqCst);
    let updated = Document::from_text("notes", "rust.txt", "Lifetimes describe references.", 1);
    let err = index.index_document(&updated).await.unwrap_err();
    assert!(matches!(err, IndexError::EmbeddingFailed(_)));
    assert!(matches!(index.state(), IndexingState::Error { .. }));

    embedder.fail.store(false, Ordering::SeqCst);
    assert_eq!(index.chunk_count(), 3);
    assert_eq!(persistence.chunk_count(), 3);
    let after = index.search("garbage collection", 3, 0.1).await.unwrap();
    assert_eq!(after, before);
    assert!(index.search("lifetimes", 3, 0.1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_reindex_keeps_existing_chunks() {
    let embedder = Arc::new(SwitchEmbedder::default());
    let persistence = Arc::new(InMemoryPersistence::new());
    let index = Index::new(embedder.clone(), persistence.clone(), chunking());
    index.index_document(&notes()).await.unwrap();
    let before = index.search("ownership", 3, 0.1).await.unwrap();
    assert!(!before.is_empty());

    let cancel = CancelFlag::new();
    *embedder.cancel_on_use.lock().unwrap() = Some(cancel.clone());
    let updated = Document::from_text(
        "notes",
        "rust.txt",
        "Lifetimes describe references.\n\nTraits describe behaviour.\n\nMacros write code.",
        1,
    );
    let result = index.index_document_with_cancel(&updated, &cancel).await;
    assert_eq!(result, Err(IndexError::Cancelled));
    *embedder.cancel_on_use.lock().unwrap() = None;

    assert_eq!(index.state(), IndexingState::Ready);
    assert_eq!(index.chunk_count(), 3);
    assert_eq!(persistence.chunk_count(), 3);
    assert_eq!(index.search("ownership", 3, 0.1).await.unwrap(), before);
    assert!(index.search("lifetimes", 3, 0.1).await.unwrap().is_empty());
}

fn version(tag: &str) -> Document {
    let text = (1..=6)
        .map(|i| format!("Shared {} fact number {}.", tag, i))
        .collect::<Vec<_>>()
        .join("\n\n");
    Document::from_text("doc", "doc.txt", text, 1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_search_during_reindex_sees_one_version() {
    let index = Arc::new(Index::new(
        Arc::new(SwitchEmbedder::slow(Duration::from_millis(5))),
        Arc::new(InMemoryPersistence::new()),
        chunking(),
    ));
    index.index_document(&version("vintage")).await.unwrap();
    let vintage_chunks = index.chunk_count();

    let done = Arc::new(AtomicBool::new(false));
    let searcher = {
        let index = Arc::clone(&index);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut observed = Vec::new();
            while !done.load(Ordering::SeqCst) {
                let results = index.search("shared fact", 100, 0.0).await.unwrap();
                let contents: Vec<String> = results.into_iter().map(|r| r.chunk.content).collect();
                observed.push(contents);
            }
            observed
        })
    };

    for tag in ["fresh", "vintage", "fresh"] {
        index.index_document(&version(tag)).await.unwrap();
    }
    let fresh_chunks = index.chunk_count();
    done.store(true, Ordering::SeqCst);
    let observed = searcher.await.unwrap();

    assert!(!observed.is_empty());
    for contents in observed {
        let vintage = contents.iter().filter(|c| c.contains("vintage")).count();
        let fresh = contents.iter().filter(|c| c.contains("fresh")).count();
        assert!(
            (vintage == contents.len() && contents.len() == vintage_chunks)
                || (fresh == contents.len() && contents.len() == fresh_chunks),
            "mixed or partial result set: {:?}",
            contents
        );
    }
}
