//! Document ingestion: decode a file and index its text.
//!
//! Decoding failures leave the index untouched. Re-ingesting a file with
//! the same name replaces its earlier chunks.

use std::path::Path;

use serde::Serialize;

use crate::cancel::CancelFlag;
use crate::decoder;
use crate::error::{ParseError, PipelineError};
use crate::index::Index;

/// Outcome of one successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub file_name: String,
    pub page_count: usize,
    pub word_count: usize,
    pub char_count: usize,
    pub chunks: usize,
}

/// Decode and index the file at `path`.
pub async fn ingest_file(
    index: &Index,
    path: &Path,
    cancel: &CancelFlag,
) -> Result<IngestReport, PipelineError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ParseError::Unsupported(path.display().to_string()))?
        .to_string();

    let document = decoder::parse(path, &file_name).await?;
    let chunks = index.index_document_with_cancel(&document, cancel).await?;

    tracing::info!(
        file_name = %document.file_name,
        pages = document.page_count,
        words = document.word_count,
        chunks,
        "ingested document"
    );

    Ok(IngestReport {
        document_id: document.id,
        file_name: document.file_name,
        page_count: document.page_count,
        word_count: document.word_count,
        char_count: document.char_count,
        chunks,
    })
}

/// Decode and index in-memory content under `file_name`.
pub async fn ingest_bytes(
    index: &Index,
    bytes: Vec<u8>,
    file_name: &str,
) -> Result<IngestReport, PipelineError> {
    let name = file_name.to_string();
    let document = tokio::task::spawn_blocking(move || decoder::parse_bytes(&bytes, &name))
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))??;
    let chunks = index.index_document(&document).await?;

    Ok(IngestReport {
        document_id: document.id,
        file_name: document.file_name,
        page_count: document.page_count,
        word_count: document.word_count,
        char_count: document.char_count,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use localllm_core::embedding::KeywordEmbedder;
    use localllm_core::store::memory::InMemoryPersistence;
    use std::sync::Arc;

    fn index() -> Index {
        Index::new(
            Arc::new(KeywordEmbedder),
            Arc::new(InMemoryPersistence::new()),
            ChunkingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ingest_file_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes\n\nThe borrow checker enforces aliasing rules.").unwrap();

        let index = index();
        let report = ingest_file(&index, &path, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.file_name, "notes.md");
        assert_eq!(report.chunks, 1);
        assert_eq!(report.page_count, 1);
        assert_eq!(index.list_documents().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_leaves_index_untouched() {
        let index = index();
        let err = ingest_bytes(&index, b"data".to_vec(), "photo.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::Unsupported(_))));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_reingest_replaces() {
        let index = index();
        ingest_bytes(&index, b"first version".to_vec(), "a.txt").await.unwrap();
        ingest_bytes(&index, b"second version".to_vec(), "a.txt").await.unwrap();
        let docs = index.list_documents();
        assert_eq!(docs.len(), 1);
        let hits = index.search("second", 3, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.content.contains("second"));
    }
}
