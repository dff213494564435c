//! Backend that simulates a model without any native library.
//!
//! Loading waits a configurable delay, generation streams a canned reply
//! one word at a time. Useful for developing the UI and for tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use localllm_core::models::GenerationConfig;

use super::{InferenceBackend, LoadParams, ModelInfo, StopReason};
use crate::cancel::CancelFlag;
use crate::error::NativeError;

const DEFAULT_RESPONSE: &str = "I am a stub response from localllm. \
    No native inference library is linked. \
    This reply simulates what a real model would stream.";

#[derive(Debug, Clone)]
struct Loaded {
    path: PathBuf,
    params: LoadParams,
}

pub struct StubBackend {
    response: String,
    load_delay: Duration,
    token_delay: Duration,
    loaded: Mutex<Option<Loaded>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            response: DEFAULT_RESPONSE.to_string(),
            load_delay: Duration::from_millis(500),
            token_delay: Duration::from_millis(50),
            loaded: Mutex::new(None),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    pub fn with_delays(mut self, load_delay: Duration, token_delay: Duration) -> Self {
        self.load_delay = load_delay;
        self.token_delay = token_delay;
        self
    }

    fn loaded(&self) -> Option<Loaded> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Split text into word pieces, each keeping its trailing space.
fn word_pieces(text: &str) -> Vec<&str> {
    text.split_inclusive(' ').collect()
}

impl InferenceBackend for StubBackend {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<(), NativeError> {
        tracing::info!(path = %path.display(), "stub: loading model");
        std::thread::sleep(self.load_delay);
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = Some(Loaded {
            path: path.to_path_buf(),
            params: *params,
        });
        Ok(())
    }

    fn unload(&self) {
        tracing::info!("stub: freeing model");
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn clear_cache(&self) {
        tracing::debug!("stub: clearing KV cache");
    }

    fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StopReason, NativeError> {
        if self.loaded().is_none() {
            return Err(NativeError::new("Model not loaded"));
        }
        if prompt.trim().is_empty() {
            return Err(NativeError::new("Empty prompt"));
        }

        for (i, piece) in word_pieces(&self.response).into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if i >= config.max_tokens || !sink(piece) {
                return Ok(StopReason::MaxTokens);
            }
            std::thread::sleep(self.token_delay);
        }
        Ok(StopReason::EndOfGeneration)
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.loaded().map(|loaded| ModelInfo {
            description: format!("stub ({})", loaded.path.display()),
            n_params: 0,
            size_bytes: 0,
            context_size: loaded.params.context_size,
        })
    }

    fn system_info(&self) -> String {
        "stub backend: native inference library not linked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_stub(response: &str) -> StubBackend {
        StubBackend::new()
            .with_response(response)
            .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_generate_requires_load() {
        let stub = fast_stub("a b");
        let err = stub
            .generate("hi", &GenerationConfig::default(), &CancelFlag::new(), &mut |_| true)
            .unwrap_err();
        assert_eq!(err.0, "Model not loaded");
    }

    #[test]
    fn test_streams_words_in_order() {
        let stub = fast_stub("one two three");
        stub.load(Path::new("m.gguf"), &LoadParams::default()).unwrap();
        let mut out = Vec::new();
        let reason = stub
            .generate("hi", &GenerationConfig::default(), &CancelFlag::new(), &mut |p| {
                out.push(p.to_string());
                true
            })
            .unwrap();
        assert_eq!(reason, StopReason::EndOfGeneration);
        assert_eq!(out, vec!["one ", "two ", "three"]);
        assert_eq!(stub.model_info().unwrap().context_size, 2048);
    }

    #[test]
    fn test_respects_max_tokens_and_unload() {
        let stub = fast_stub("a b c d e f");
        stub.load(Path::new("m.gguf"), &LoadParams::default()).unwrap();
        let config = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::default()
        };
        let mut count = 0;
        let reason = stub
            .generate("hi", &config, &CancelFlag::new(), &mut |_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(reason, StopReason::MaxTokens);
        assert_eq!(count, 2);

        stub.unload();
        stub.unload();
        assert!(stub.model_info().is_none());
    }
}
