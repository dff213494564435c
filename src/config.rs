//! TOML configuration.
//!
//! Every section is optional; omitted keys take the defaults below, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! [db]
//! path = "data/localllm.sqlite"
//!
//! [chunking]
//! window_chars = 1000
//! overlap_chars = 200
//!
//! [retrieval]
//! enabled = true
//! top_k = 3
//! similarity_threshold = 0.3
//! max_context_chars = 2000
//!
//! [embedding]
//! provider = "keyword"        # or "local" (feature local-embeddings)
//! model = "bge-small-en-v1.5"
//!
//! [model]
//! threads = 4
//! context_size = 2048
//! use_mmap = true
//!
//! [generation]
//! max_tokens = 512
//! temperature = 0.8
//!
//! [prompt]
//! template = "chatml"
//! system_prompt = "You are a helpful assistant."
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use localllm_core::models::GenerationConfig;

use crate::model::LoadParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/localllm.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_window_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Characters of raw text used as context when nothing matches. 0 disables.
    #[serde(default)]
    pub fallback_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_context_chars: default_max_context_chars(),
            fallback_chars: 0,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    3
}
fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_max_context_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub show_download_progress: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            show_download_progress: false,
        }
    }
}

fn default_provider() -> String {
    "keyword".to_string()
}
fn default_embedding_model() -> String {
    "bge-small-en-v1.5".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    #[serde(default)]
    pub use_acceleration: bool,
    /// Layers offloaded when acceleration is enabled.
    #[serde(default)]
    pub gpu_layers: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            context_size: default_context_size(),
            batch_size: default_batch_size(),
            use_mmap: true,
            use_mlock: false,
            use_acceleration: false,
            gpu_layers: 0,
        }
    }
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}
fn default_context_size() -> u32 {
    2048
}
fn default_batch_size() -> u32 {
    512
}

impl ModelConfig {
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            threads: self.threads,
            context_size: self.context_size,
            batch_size: self.batch_size,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            use_acceleration: self.use_acceleration,
            gpu_layers: self.gpu_layers,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Most recent complete messages included in the prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            system_prompt: default_system_prompt(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_template() -> String {
    "chatml".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer concisely.".to_string()
}
fn default_history_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.window_chars == 0 {
        anyhow::bail!("chunking.window_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.window_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.window_chars");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }

    // Validate model
    if config.model.threads < 1 {
        anyhow::bail!("model.threads must be >= 1");
    }
    if config.model.context_size == 0 {
        anyhow::bail!("model.context_size must be > 0");
    }

    // Validate generation
    if config.generation.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&config.generation.top_p) {
        anyhow::bail!("generation.top_p must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "keyword" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be keyword or local.",
            other
        ),
    }

    Ok(())
}
