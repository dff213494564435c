//! Embedder construction.
//!
//! Two backends implement [`Embedder`]:
//!
//! - **`keyword`**: [`KeywordEmbedder`] from the core crate. Term-frequency
//!   signatures, no model, no download. Default.
//! - **`local`**: [`LocalEmbedder`], dense sentence embeddings computed
//!   on-device with fastembed (requires `--features local-embeddings`). The
//!   model is downloaded from Hugging Face on first use and cached; after that
//!   no network calls are made.
//!
//! Both produce a [`Representation`](localllm_core::embedding::Representation)
//! scored by the same similarity function, so the index has one code path.

use std::sync::Arc;

use anyhow::{bail, Result};

pub use localllm_core::embedding::{Embedder, KeywordEmbedder};

use crate::config::EmbeddingConfig;

/// Create the configured [`Embedder`].
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"keyword"` | [`KeywordEmbedder`] |
/// | `"local"` | [`LocalEmbedder`] (feature `local-embeddings`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordEmbedder)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use localllm_core::embedding::{Embedder, Representation};

    use crate::config::EmbeddingConfig;

    /// fastembed-backed dense embedder.
    ///
    /// The ONNX session is created lazily on the blocking pool and reused.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        show_download_progress: bool,
        session: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            Ok(Self {
                model_name: config.model.clone(),
                model: config_to_fastembed_model(&config.model)?,
                show_download_progress: config.show_download_progress,
                session: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
                other
            ),
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        async fn represent(&self, text: &str) -> Result<Representation> {
            let session = Arc::clone(&self.session);
            let model = self.model.clone();
            let show_progress = self.show_download_progress;
            let texts = vec![text.to_string()];

            tokio::task::spawn_blocking(move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| anyhow!("embedding session lock poisoned"))?;
                if guard.is_none() {
                    tracing::info!(model = ?model, "initializing local embedding model");
                    let embedding = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model)
                            .with_show_download_progress(show_progress),
                    )
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                    *guard = Some(embedding);
                }
                let embedding = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("embedding session missing"))?;
                let mut vectors = embedding
                    .embed(texts, None)
                    .map_err(|e| anyhow!("Local embedding failed: {}", e))?;
                let vector = vectors
                    .pop()
                    .ok_or_else(|| anyhow!("Local embedding returned no vector"))?;
                Ok(Representation::Dense(vector))
            })
            .await?
        }
    }
}
