//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use localllm::backend::{InferenceBackend, LoadParams, ModelInfo, StopReason};
use localllm::cancel::CancelFlag;
use localllm::error::NativeError;
use localllm::model::{ModelSession, ModelSpec};
use localllm_core::models::GenerationConfig;

/// Backend that replays a fixed list of pieces and records every call.
pub struct ScriptedBackend {
    pieces: Vec<String>,
    token_delay: Duration,
    load_delay: Duration,
    fail_load: Option<String>,
    fail_after: Option<(usize, String)>,
    loaded: AtomicBool,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub clears: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(pieces: &[&str]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            token_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_load: None,
            fail_after: None,
            loaded: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// `n` pieces "t0 ", "t1 ", …
    pub fn counting(n: usize) -> Self {
        let pieces: Vec<String> = (0..n).map(|i| format!("t{} ", i)).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        Self::new(&refs)
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_load(mut self, message: &str) -> Self {
        self.fail_load = Some(message.to_string());
        self
    }

    pub fn failing_after(mut self, pieces: usize, message: &str) -> Self {
        self.fail_after = Some((pieces, message.to_string()));
        self
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load(&self, _path: &Path, _params: &LoadParams) -> Result<(), NativeError> {
        std::thread::sleep(self.load_delay);
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_load {
            return Err(NativeError::new(message.clone()));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn clear_cache(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StopReason, NativeError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(NativeError::new("Model not loaded"));
        }
        self.prompts.lock().unwrap().push(prompt.to_string());

        for (i, piece) in self.pieces.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if let Some((after, message)) = &self.fail_after {
                if i == *after {
                    return Err(NativeError::new(message.clone()));
                }
            }
            if !sink(piece) {
                return Ok(StopReason::MaxTokens);
            }
            std::thread::sleep(self.token_delay);
        }
        Ok(StopReason::EndOfGeneration)
    }

    fn model_info(&self) -> Option<ModelInfo> {
        Some(ModelInfo {
            description: "scripted".to_string(),
            n_params: 0,
            size_bytes: 0,
            context_size: 2048,
        })
    }

    fn system_info(&self) -> String {
        "scripted".to_string()
    }
}

pub fn spec(id: &str) -> ModelSpec {
    ModelSpec::new(id, format!("/models/{}.gguf", id))
}

/// A model session with `backend` already loaded.
pub async fn loaded_session(backend: Arc<ScriptedBackend>) -> Arc<ModelSession> {
    let session = Arc::new(ModelSession::new(backend));
    session
        .load(spec("test-model"), LoadParams::default())
        .await
        .unwrap();
    session
}
