//! Model lifecycle: load, unload, and the single generation slot.
//!
//! [`ModelSession`] owns one [`InferenceBackend`] and holds at most one
//! loaded model. Its state is published on a `watch` channel as
//! [`ModelLoadingState`]:
//!
//! ```text
//! NotLoaded ──load──▶ Loading ──ok──▶ Loaded ──unload──▶ NotLoaded
//!                        │
//!                        └──native failure──▶ Error
//! ```
//!
//! Loads are serialized. A load arriving while another is in flight marks
//! the earlier one superseded; the native call cannot be interrupted, so
//! the superseded call releases whatever it loaded and returns
//! [`LoadError::Superseded`]. The session also tracks the one active
//! generation so a second one is refused and `unload` can cancel it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

pub use crate::backend::LoadParams;
use crate::backend::{InferenceBackend, ModelInfo};
use crate::cancel::CancelFlag;
use crate::error::{GenerationError, LoadError, NativeError};

/// A model file and the id it is known by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub id: String,
    pub path: PathBuf,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// The currently loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelHandle {
    pub model_id: String,
    pub path: PathBuf,
    pub params: LoadParams,
}

impl ModelHandle {
    pub fn threads(&self) -> u32 {
        self.params.threads
    }

    pub fn context_size(&self) -> u32 {
        self.params.context_size
    }

    pub fn use_mmap(&self) -> bool {
        self.params.use_mmap
    }

    pub fn use_acceleration(&self) -> bool {
        self.params.use_acceleration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelLoadingState {
    NotLoaded,
    Loading { progress: f32 },
    Loaded { model: ModelHandle },
    Error { message: String },
}

struct ActiveGeneration {
    session_id: String,
    cancel: CancelFlag,
}

pub struct ModelSession {
    backend: Arc<dyn InferenceBackend>,
    state_tx: watch::Sender<ModelLoadingState>,
    load_lock: tokio::sync::Mutex<()>,
    pending_load: Mutex<Option<CancelFlag>>,
    active: Mutex<Option<ActiveGeneration>>,
}

impl ModelSession {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        let (state_tx, _) = watch::channel(ModelLoadingState::NotLoaded);
        Self {
            backend,
            state_tx,
            load_lock: tokio::sync::Mutex::new(()),
            pending_load: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ModelLoadingState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelLoadingState> {
        self.state_tx.subscribe()
    }

    /// The loaded model, if any.
    pub fn loaded(&self) -> Option<ModelHandle> {
        match self.state() {
            ModelLoadingState::Loaded { model } => Some(model),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }

    /// Load a model, replacing any loaded one.
    ///
    /// Loading the model that is already loaded with identical parameters
    /// is a no-op. Invalid parameters are rejected before any state change.
    pub async fn load(&self, spec: ModelSpec, params: LoadParams) -> Result<(), LoadError> {
        if params.threads < 1 {
            return Err(LoadError::InvalidThreads(params.threads));
        }
        if params.context_size == 0 {
            return Err(LoadError::InvalidContextSize);
        }

        let attempt = CancelFlag::new();
        if let Some(previous) = self.lock_pending().replace(attempt.clone()) {
            previous.cancel();
        }

        let _guard = self.load_lock.lock().await;
        if attempt.is_cancelled() {
            return Err(LoadError::Superseded);
        }

        if let Some(current) = self.loaded() {
            if current.model_id == spec.id && current.path == spec.path && current.params == params {
                tracing::debug!(model_id = %spec.id, "model already loaded");
                return Ok(());
            }
            tracing::info!(model_id = %current.model_id, "unloading current model");
            self.cancel_generation();
            self.native_unload().await;
        }

        self.set_state(ModelLoadingState::Loading { progress: 0.0 });
        tracing::info!(model_id = %spec.id, path = %spec.path.display(), "loading model");

        let backend = Arc::clone(&self.backend);
        let path = spec.path.clone();
        let result = tokio::task::spawn_blocking(move || backend.load(&path, &params))
            .await
            .unwrap_or_else(|e| Err(NativeError::new(format!("load task failed: {e}"))));

        if attempt.is_cancelled() {
            if result.is_ok() {
                self.native_unload().await;
            }
            self.set_state(ModelLoadingState::NotLoaded);
            tracing::info!(model_id = %spec.id, "load superseded");
            return Err(LoadError::Superseded);
        }

        match result {
            Ok(()) => {
                self.set_state(ModelLoadingState::Loading { progress: 1.0 });
                self.set_state(ModelLoadingState::Loaded {
                    model: ModelHandle {
                        model_id: spec.id.clone(),
                        path: spec.path,
                        params,
                    },
                });
                tracing::info!(model_id = %spec.id, "model loaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(model_id = %spec.id, error = %e, "model load failed");
                self.set_state(ModelLoadingState::Error {
                    message: e.0.clone(),
                });
                Err(LoadError::Native(e.0))
            }
        }
    }

    /// Release the model. Cancels any in-flight load or generation.
    /// Idempotent.
    pub async fn unload(&self) {
        if let Some(pending) = self.lock_pending().take() {
            pending.cancel();
        }
        self.cancel_generation();

        let _guard = self.load_lock.lock().await;
        if self.is_loaded() {
            self.native_unload().await;
            tracing::info!("model unloaded");
        }
        self.set_state(ModelLoadingState::NotLoaded);
    }

    /// Reset the key/value cache, as when switching conversations.
    ///
    /// A no-op without a loaded model. Refused while a generation runs.
    pub async fn clear_context(&self) -> Result<(), GenerationError> {
        const CLEAR_SLOT: &str = "clear-context";

        if !self.is_loaded() {
            return Ok(());
        }
        self.begin_generation(CLEAR_SLOT, CancelFlag::new())?;
        let backend = Arc::clone(&self.backend);
        if let Err(e) = tokio::task::spawn_blocking(move || backend.clear_cache()).await {
            tracing::warn!(error = %e, "clear cache task failed");
        }
        self.end_generation(CLEAR_SLOT);
        tracing::debug!("model context cleared");
        Ok(())
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        if self.is_loaded() {
            self.backend.model_info()
        } else {
            None
        }
    }

    pub fn system_info(&self) -> String {
        self.backend.system_info()
    }

    pub fn is_generating(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Cancel the active generation. Returns whether one was running.
    pub fn cancel_generation(&self) -> bool {
        match self.lock_active().as_ref() {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim the generation slot for `session_id`.
    pub(crate) fn begin_generation(
        &self,
        session_id: &str,
        cancel: CancelFlag,
    ) -> Result<(), GenerationError> {
        let mut active = self.lock_active();
        if active.is_some() {
            return Err(GenerationError::AlreadyRunning);
        }
        if !self.is_loaded() {
            return Err(GenerationError::ModelNotLoaded);
        }
        *active = Some(ActiveGeneration {
            session_id: session_id.to_string(),
            cancel,
        });
        Ok(())
    }

    /// Release the generation slot if `session_id` still holds it.
    pub(crate) fn end_generation(&self, session_id: &str) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.session_id == session_id) {
            *active = None;
        }
    }

    pub(crate) fn backend(&self) -> Arc<dyn InferenceBackend> {
        Arc::clone(&self.backend)
    }

    async fn native_unload(&self) {
        let backend = Arc::clone(&self.backend);
        if let Err(e) = tokio::task::spawn_blocking(move || backend.unload()).await {
            tracing::warn!(error = %e, "unload task failed");
        }
    }

    fn set_state(&self, state: ModelLoadingState) {
        self.state_tx.send_replace(state);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<CancelFlag>> {
        self.pending_load.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use std::time::Duration;

    fn session() -> ModelSession {
        ModelSession::new(Arc::new(
            StubBackend::new().with_delays(Duration::ZERO, Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn test_invalid_threads_rejected_without_state_change() {
        let session = session();
        let params = LoadParams {
            threads: 0,
            ..LoadParams::default()
        };
        let err = session
            .load(ModelSpec::new("m", "m.gguf"), params)
            .await
            .unwrap_err();
        assert_eq!(err, LoadError::InvalidThreads(0));
        assert_eq!(session.state(), ModelLoadingState::NotLoaded);
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let session = session();
        session
            .load(ModelSpec::new("m", "m.gguf"), LoadParams::default())
            .await
            .unwrap();
        let handle = session.loaded().unwrap();
        assert_eq!(handle.model_id, "m");
        assert_eq!(handle.threads(), 4);
        assert!(session.model_info().is_some());

        session.unload().await;
        session.unload().await;
        assert_eq!(session.state(), ModelLoadingState::NotLoaded);
        assert!(session.model_info().is_none());
    }

    #[tokio::test]
    async fn test_generation_slot() {
        let session = session();
        assert_eq!(
            session.begin_generation("a", CancelFlag::new()),
            Err(GenerationError::ModelNotLoaded)
        );
        session
            .load(ModelSpec::new("m", "m.gguf"), LoadParams::default())
            .await
            .unwrap();
        let cancel = CancelFlag::new();
        session.begin_generation("a", cancel.clone()).unwrap();
        assert_eq!(
            session.begin_generation("b", CancelFlag::new()),
            Err(GenerationError::AlreadyRunning)
        );
        assert_eq!(session.clear_context().await, Err(GenerationError::AlreadyRunning));
        assert!(session.cancel_generation());
        assert!(cancel.is_cancelled());

        session.end_generation("other");
        assert!(session.is_generating());
        session.end_generation("a");
        assert!(!session.is_generating());
        session.clear_context().await.unwrap();
    }
}
