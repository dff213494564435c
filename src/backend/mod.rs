//! Native inference backends.
//!
//! [`InferenceBackend`] is the seam between the model/generation sessions
//! and whatever actually runs the model. Methods are blocking; callers run
//! them on `tokio::task::spawn_blocking`.
//!
//! | Backend | Feature | Notes |
//! |---------|---------|-------|
//! | [`StubBackend`] | always | Streams a canned reply word by word; for UI work and tests |
//! | `LlamaBackend` | `llama-cpp` | GGUF models through llama.cpp on a dedicated worker thread |

#[cfg(feature = "llama-cpp")]
pub mod llama;
pub mod stub;

use std::path::Path;

use localllm_core::models::GenerationConfig;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::error::NativeError;

#[cfg(feature = "llama-cpp")]
pub use llama::LlamaBackend;
pub use stub::StubBackend;

/// Parameters for loading a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    pub threads: u32,
    pub context_size: u32,
    pub batch_size: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub use_acceleration: bool,
    pub gpu_layers: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            threads: 4,
            context_size: 2048,
            batch_size: 512,
            use_mmap: true,
            use_mlock: false,
            use_acceleration: false,
            gpu_layers: 0,
        }
    }
}

/// Why a backend stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Token budget reached, or the sink asked to stop.
    MaxTokens,
    /// The model emitted an end-of-generation token.
    EndOfGeneration,
    /// The context window is full.
    ContextFull,
    Cancelled,
}

/// Facts about the loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub description: String,
    pub n_params: u64,
    pub size_bytes: u64,
    pub context_size: u32,
}

/// A native model runtime holding at most one model.
pub trait InferenceBackend: Send + Sync {
    /// Load a model file, replacing any loaded model.
    fn load(&self, path: &Path, params: &LoadParams) -> Result<(), NativeError>;

    /// Release the loaded model. Idempotent.
    fn unload(&self);

    /// Reset the key/value cache of the loaded model.
    fn clear_cache(&self);

    /// Generate a continuation of `prompt`.
    ///
    /// Each decoded piece of text is passed to `sink`; a `false` return
    /// stops generation. `cancel` is checked before every token. Returns
    /// [`StopReason::Cancelled`] when stopped by `cancel`.
    fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StopReason, NativeError>;

    fn model_info(&self) -> Option<ModelInfo> {
        None
    }

    fn system_info(&self) -> String;
}

/// Tokens considered by the repeat penalty.
#[cfg_attr(not(feature = "llama-cpp"), allow(dead_code))]
pub(crate) const PENALTY_LAST_N: i32 = 64;

/// Sampler settings for a native backend. Non-positive values fall back
/// to the [`GenerationConfig`] defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(not(feature = "llama-cpp"), allow(dead_code))]
pub(crate) struct Sampling {
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
}

#[cfg_attr(not(feature = "llama-cpp"), allow(dead_code))]
impl Sampling {
    pub(crate) fn from_config(config: &GenerationConfig) -> Self {
        let defaults = GenerationConfig::default();
        Self {
            top_k: if config.top_k > 0 { config.top_k } else { defaults.top_k },
            top_p: if config.top_p > 0.0 { config.top_p } else { defaults.top_p },
            temperature: if config.temperature > 0.0 {
                config.temperature
            } else {
                defaults.temperature
            },
            repeat_penalty: if config.repeat_penalty > 0.0 {
                config.repeat_penalty
            } else {
                defaults.repeat_penalty
            },
        }
    }
}

/// Take the longest valid UTF-8 prefix out of `buf`.
///
/// Token pieces can split a multi-byte character; an incomplete trailing
/// sequence stays in the buffer for the next token. Invalid bytes are
/// replaced with U+FFFD.
pub(crate) fn drain_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let out = s.to_string();
            buf.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&buf[..valid]).into_owned();
            buf.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_replaces_non_positive_values() {
        let config = GenerationConfig {
            top_k: 0,
            top_p: -1.0,
            temperature: 0.0,
            repeat_penalty: 0.0,
            ..GenerationConfig::default()
        };
        let sampling = Sampling::from_config(&config);
        assert_eq!(
            sampling,
            Sampling {
                top_k: 40,
                top_p: 0.95,
                temperature: 0.8,
                repeat_penalty: 1.1,
            }
        );

        let config = GenerationConfig {
            top_k: 10,
            top_p: 0.5,
            temperature: 0.2,
            repeat_penalty: 1.3,
            ..GenerationConfig::default()
        };
        let sampling = Sampling::from_config(&config);
        assert_eq!((sampling.top_k, sampling.repeat_penalty), (10, 1.3));
        assert_eq!((sampling.top_p, sampling.temperature), (0.5, 0.2));
    }

    #[test]
    fn test_drain_utf8_keeps_incomplete_suffix() {
        let bytes = "é".as_bytes();
        let mut buf = vec![b'a', bytes[0]];
        assert_eq!(drain_utf8(&mut buf), "a");
        assert_eq!(buf, vec![bytes[0]]);
        buf.push(bytes[1]);
        assert_eq!(drain_utf8(&mut buf), "é");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_utf8_replaces_invalid() {
        let mut buf = vec![b'a', 0xff, b'b'];
        assert_eq!(drain_utf8(&mut buf), "a\u{fffd}b");
        assert!(buf.is_empty());
    }
}
