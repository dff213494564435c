//! Streaming token generation.
//!
//! [`GenerationSession::start`] claims the model's generation slot, then
//! drives the backend on the blocking pool. The caller receives a
//! [`GenerationStream`]: zero or more [`GenerationEvent::Token`]s followed by
//! exactly one terminal event (`Done`, `Error`, or `Cancelled`).
//!
//! The slot is released before the terminal event is sent, so a caller
//! that starts a new generation right after observing one is never refused
//! with `AlreadyRunning`.

use std::sync::Arc;
use std::time::Instant;

use localllm_core::models::GenerationConfig;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{InferenceBackend, StopReason};
use crate::cancel::CancelFlag;
use crate::error::GenerationError;
use crate::model::ModelSession;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationStats {
    pub tokens_generated: usize,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
    pub stop_reason: StopReason,
}

impl GenerationStats {
    fn new(tokens_generated: usize, started_at: Instant, stop_reason: StopReason) -> Self {
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        Self {
            tokens_generated,
            elapsed_ms,
            tokens_per_second: throughput(tokens_generated, elapsed_ms),
            stop_reason,
        }
    }
}

/// Tokens per second, or 0 when no time has elapsed.
pub fn throughput(tokens: usize, elapsed_ms: u64) -> f64 {
    if elapsed_ms == 0 {
        0.0
    } else {
        tokens as f64 * 1000.0 / elapsed_ms as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GenerationEvent {
    Token(String),
    Done(GenerationStats),
    Error(String),
    Cancelled(GenerationStats),
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationEvent::Token(_))
    }
}

/// One request to generate text, owned by the worker that runs it.
pub struct GenerationSession {
    id: String,
    prompt: String,
    config: GenerationConfig,
    cancel: CancelFlag,
    tokens_generated: usize,
    started_at: Instant,
}

impl GenerationSession {
    /// Start generating from `prompt`.
    ///
    /// `on_token` runs on the worker thread for each piece, before the
    /// matching `Token` event is queued. Must be called within a Tokio
    /// runtime.
    pub fn start<F>(
        model: &Arc<ModelSession>,
        prompt: impl Into<String>,
        config: GenerationConfig,
        on_token: F,
    ) -> Result<GenerationStream, GenerationError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        Self::start_with_cancel(model, prompt, config, CancelFlag::new(), on_token)
    }

    /// Like [`start`](Self::start), stopping when `cancel` is set.
    pub fn start_with_cancel<F>(
        model: &Arc<ModelSession>,
        prompt: impl Into<String>,
        config: GenerationConfig,
        cancel: CancelFlag,
        on_token: F,
    ) -> Result<GenerationStream, GenerationError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let prompt = prompt.into();
        let id = Uuid::new_v4().to_string();
        model.begin_generation(&id, cancel.clone())?;
        if prompt.trim().is_empty() {
            model.end_generation(&id);
            return Err(GenerationError::EmptyPrompt);
        }

        let session = GenerationSession {
            id: id.clone(),
            prompt,
            config,
            cancel: cancel.clone(),
            tokens_generated: 0,
            started_at: Instant::now(),
        };
        tracing::debug!(session_id = %id, max_tokens = session.config.max_tokens, "generation started");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token_tx = tx.clone();
        let backend = model.backend();
        let model = Arc::clone(model);
        let session_id = id.clone();

        tokio::spawn(async move {
            let worker = tokio::task::spawn_blocking(move || {
                session.drive(backend.as_ref(), &token_tx, on_token)
            });
            let terminal = match worker.await {
                Ok(event) => event,
                Err(e) => GenerationEvent::Error(format!("generation worker failed: {e}")),
            };
            model.end_generation(&session_id);
            match &terminal {
                GenerationEvent::Done(stats) => tracing::info!(
                    session_id = %session_id,
                    tokens = stats.tokens_generated,
                    elapsed_ms = stats.elapsed_ms,
                    tokens_per_second = stats.tokens_per_second,
                    "generation done"
                ),
                GenerationEvent::Cancelled(stats) => tracing::info!(
                    session_id = %session_id,
                    tokens = stats.tokens_generated,
                    "generation cancelled"
                ),
                GenerationEvent::Error(message) => {
                    tracing::warn!(session_id = %session_id, error = %message, "generation failed")
                }
                GenerationEvent::Token(_) => {}
            }
            let _ = tx.send(terminal).await;
        });

        Ok(GenerationStream {
            id,
            cancel,
            events: rx,
        })
    }

    /// Run the backend to completion and produce the terminal event.
    fn drive<F>(
        mut self,
        backend: &dyn InferenceBackend,
        tx: &mpsc::Sender<GenerationEvent>,
        mut on_token: F,
    ) -> GenerationEvent
    where
        F: FnMut(&str),
    {
        let max_tokens = self.config.max_tokens;
        let cancel = self.cancel.clone();
        let mut tokens = 0usize;

        let result = {
            let mut sink = |piece: &str| -> bool {
                if cancel.is_cancelled() || tokens >= max_tokens {
                    return false;
                }
                on_token(piece);
                if tx.blocking_send(GenerationEvent::Token(piece.to_string())).is_err() {
                    cancel.cancel();
                    return false;
                }
                tokens += 1;
                tokens < max_tokens
            };
            if max_tokens == 0 {
                Ok(StopReason::MaxTokens)
            } else {
                backend.generate(&self.prompt, &self.config, &self.cancel, &mut sink)
            }
        };
        self.tokens_generated = tokens;

        let stats = |reason| GenerationStats::new(self.tokens_generated, self.started_at, reason);
        if self.cancel.is_cancelled() {
            return GenerationEvent::Cancelled(stats(StopReason::Cancelled));
        }
        match result {
            Ok(_) if self.tokens_generated >= max_tokens => {
                GenerationEvent::Done(stats(StopReason::MaxTokens))
            }
            Ok(reason) => GenerationEvent::Done(stats(reason)),
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "backend error");
                GenerationEvent::Error(e.0)
            }
        }
    }
}

/// Caller side of a running generation.
pub struct GenerationStream {
    id: String,
    cancel: CancelFlag,
    events: mpsc::Receiver<GenerationEvent>,
}

impl GenerationStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The stream still ends with a terminal event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, or `None` after the terminal event.
    pub async fn next(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// Drain the stream into the generated text and its terminal event.
    pub async fn collect(mut self) -> (String, GenerationEvent) {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                GenerationEvent::Token(piece) => text.push_str(&piece),
                terminal => return (text, terminal),
            }
        }
        (
            text,
            GenerationEvent::Error("generation ended without a terminal event".to_string()),
        )
    }
}
