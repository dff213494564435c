//! Error taxonomy for the pipeline.
//!
//! Each component fails with its own enum so callers can match on the
//! cases they handle and degrade the rest:
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`ParseError`] | [`decoder`](crate::decoder) | that one ingestion fails |
//! | [`IndexError`] | [`Index`](crate::index::Index) | index keeps its prior content |
//! | [`LoadError`] | [`ModelSession::load`](crate::model::ModelSession::load) | session ends in `Error` |
//! | [`NativeError`] | [`InferenceBackend`](crate::backend::InferenceBackend) | terminal `Error` event |
//! | [`GenerationError`] | [`GenerationSession::start`](crate::generation::GenerationSession::start) | rejected, no side effects |
//! | [`PipelineError`] | [`Pipeline`](crate::pipeline::Pipeline) | surfaced to the caller |
//!
//! Cancellation is not an error: it is a terminal state of a generation.
//! Indexing can still report [`IndexError::Cancelled`] because the caller
//! asked for an outcome.

use localllm_core::chunk::ChunkError;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("file is not valid UTF-8 text: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("document is empty after normalization")]
    EmptyDocument,
    #[error("invalid chunking parameters: {0}")]
    InvalidChunking(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("indexing cancelled")]
    Cancelled,
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl From<ChunkError> for IndexError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::EmptyDocument => IndexError::EmptyDocument,
            other => IndexError::InvalidChunking(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("thread count must be >= 1 (got {0})")]
    InvalidThreads(u32),
    #[error("context size must be > 0")]
    InvalidContextSize,
    #[error("model load superseded by a newer load request")]
    Superseded,
    #[error("native backend: {0}")]
    Native(String),
}

/// Failure reported by an inference backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("a generation is already running")]
    AlreadyRunning,
    #[error("no model is loaded")]
    ModelNotLoaded,
    #[error("prompt is empty")]
    EmptyPrompt,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("turn task ended unexpectedly: {0}")]
    Join(String),
}
