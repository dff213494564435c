//! Chat turn orchestration: retrieval, prompt, streamed generation,
//! persistence.
//!
//! # Turn Flow
//!
//! ```text
//! send(conversation, text)
//!   ├─ claim the conversation (one active turn each)
//!   ├─ refuse if no model is loaded or one is generating
//!   ├─ clear model context if the conversation changed
//!   ├─ search + assemble context (failures → no context)
//!   ├─ build prompt from recent complete history + the new message
//!   ├─ start generation
//!   └─ persist the user message ──▶ turn task
//!                             ├─ Token     → append to streaming message
//!                             ├─ Done      → complete + persist
//!                             ├─ Cancelled → complete + persist partial text
//!                             └─ Error     → "[error: …]" + persist
//! ```
//!
//! The streaming assistant message is owned by the turn task and published
//! on a `watch` channel; callers observe it through [`TurnHandle::message`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use localllm_core::context::assemble;
use localllm_core::models::{ChatMessage, GenerationConfig, Role};
use localllm_core::prompt::build_prompt;
use localllm_core::store::Persistence;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::InferenceBackend;
use crate::cancel::CancelFlag;
use crate::config::{Config, PromptConfig, RetrievalConfig};
use crate::db;
use crate::embedding::create_embedder;
use crate::error::{GenerationError, PipelineError};
use crate::generation::{GenerationEvent, GenerationSession, GenerationStats};
use crate::index::Index;
use crate::ingest::{self, IngestReport};
use crate::migrate;
use crate::model::ModelSession;
use crate::sqlite_store::SqlitePersistence;

/// The subset of [`Config`] a pipeline reads on every turn.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub generation: GenerationConfig,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            retrieval: config.retrieval.clone(),
            prompt: config.prompt.clone(),
            generation: config.generation.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

type ActiveTurns = Arc<Mutex<HashMap<String, CancelFlag>>>;

/// Removes a conversation's active-turn entry when dropped.
struct TurnClaim {
    turns: ActiveTurns,
    conversation_id: String,
}

impl TurnClaim {
    fn acquire(turns: &ActiveTurns, conversation_id: &str, cancel: CancelFlag) -> Option<Self> {
        let mut active = turns.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(conversation_id) {
            return None;
        }
        active.insert(conversation_id.to_string(), cancel);
        Some(Self {
            turns: Arc::clone(turns),
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for TurnClaim {
    fn drop(&mut self) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.conversation_id);
    }
}

pub struct Pipeline {
    index: Arc<Index>,
    model: Arc<ModelSession>,
    persistence: Arc<dyn Persistence>,
    settings: PipelineSettings,
    current_conversation: tokio::sync::Mutex<Option<String>>,
    active_turns: ActiveTurns,
}

impl Pipeline {
    pub fn new(
        index: Arc<Index>,
        model: Arc<ModelSession>,
        persistence: Arc<dyn Persistence>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            index,
            model,
            persistence,
            settings,
            current_conversation: tokio::sync::Mutex::new(None),
            active_turns: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the configured database, restore the index, and wire a
    /// pipeline around `backend`.
    pub async fn open(config: &Config, backend: Arc<dyn InferenceBackend>) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));

        let embedder = create_embedder(&config.embedding)?;
        let index = Arc::new(Index::new(
            embedder,
            Arc::clone(&persistence),
            config.chunking.clone(),
        ));
        index.restore().await?;

        let model = Arc::new(ModelSession::new(backend));
        Ok(Self::new(index, model, persistence, PipelineSettings::from(config)))
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn model(&self) -> &Arc<ModelSession> {
        &self.model
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one chat turn. Returns once generation has started.
    ///
    /// A rejected turn leaves no trace: the user message is persisted only
    /// after generation has started.
    pub async fn send(
        &self,
        conversation_id: &str,
        user_text: &str,
    ) -> Result<TurnHandle, PipelineError> {
        let cancel = CancelFlag::new();
        let claim = TurnClaim::acquire(&self.active_turns, conversation_id, cancel.clone())
            .ok_or(GenerationError::AlreadyRunning)?;

        if self.model.is_generating() {
            return Err(GenerationError::AlreadyRunning.into());
        }
        if !self.model.is_loaded() {
            return Err(GenerationError::ModelNotLoaded.into());
        }
        self.switch_conversation(conversation_id).await?;

        let user_message = ChatMessage::new(conversation_id, Role::User, user_text);
        let context = self.retrieve(user_text).await;
        let history = self.history(conversation_id, &user_message).await?;
        let prompt = build_prompt(
            &history,
            &self.settings.prompt.system_prompt,
            &self.settings.prompt.template,
            context.as_deref(),
        );
        tracing::debug!(
            conversation_id,
            history = history.len(),
            context_chars = context.as_ref().map(|c| c.chars().count()).unwrap_or(0),
            prompt_chars = prompt.chars().count(),
            "prompt built"
        );

        let started_at = Instant::now();
        let stream = GenerationSession::start_with_cancel(
            &self.model,
            prompt,
            self.settings.generation.clone(),
            cancel.clone(),
            |_| {},
        )?;

        if let Err(e) = self.persistence.upsert_message(&user_message).await {
            stream.cancel();
            return Err(PipelineError::Persistence(e));
        }

        let (message_tx, message_rx) = watch::channel(ChatMessage::streaming(conversation_id));
        let persistence = Arc::clone(&self.persistence);
        let task = tokio::spawn(async move {
            let _claim = claim;
            let mut stream = stream;
            loop {
                let event = stream.next().await.unwrap_or_else(|| {
                    GenerationEvent::Error("generation ended without a terminal event".to_string())
                });
                match event {
                    GenerationEvent::Token(piece) => {
                        message_tx.send_modify(|m| {
                            m.content.push_str(&piece);
                            m.tokens_generated += 1;
                        });
                    }
                    GenerationEvent::Done(stats) | GenerationEvent::Cancelled(stats) => {
                        message_tx.send_modify(|m| complete(m, &stats));
                        break;
                    }
                    GenerationEvent::Error(err) => {
                        let elapsed_ms = started_at.elapsed().as_millis() as u64;
                        message_tx.send_modify(|m| {
                            m.content = format!("[error: {}]", err);
                            m.is_complete = true;
                            m.generation_time_ms = elapsed_ms;
                        });
                        break;
                    }
                }
            }

            let final_message = message_tx.borrow().clone();
            match persistence.upsert_message(&final_message).await {
                Ok(()) => Ok(final_message),
                Err(e) => {
                    tracing::warn!(error = %e, message_id = %final_message.id, "failed to persist reply");
                    Err(PipelineError::Persistence(e))
                }
            }
        });

        Ok(TurnHandle {
            message: message_rx,
            cancel,
            task,
        })
    }

    /// Cancel the active turn of a conversation. Returns whether one existed.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self
            .active_turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
        {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(conversation_id)
    }

    /// Decode and index a file.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport, PipelineError> {
        ingest::ingest_file(&self.index, path, &CancelFlag::new()).await
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, PipelineError> {
        self.persistence
            .list_messages(conversation_id)
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn delete_message(&self, id: &str) -> Result<(), PipelineError> {
        self.persistence
            .delete_message(id)
            .await
            .map_err(PipelineError::Persistence)
    }

    async fn switch_conversation(&self, conversation_id: &str) -> Result<(), PipelineError> {
        let mut current = self.current_conversation.lock().await;
        if current.as_deref() == Some(conversation_id) {
            return Ok(());
        }
        self.model.clear_context().await?;
        tracing::debug!(conversation_id, "switched conversation");
        *current = Some(conversation_id.to_string());
        Ok(())
    }

    /// Context for `query`, or `None`. Never fails the turn.
    async fn retrieve(&self, query: &str) -> Option<String> {
        let retrieval = &self.settings.retrieval;
        if !retrieval.enabled {
            return None;
        }

        let results = match self
            .index
            .search(query, retrieval.top_k, retrieval.similarity_threshold)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, continuing without context");
                return None;
            }
        };

        let fallback = self.fallback_text();
        assemble(&results, retrieval.max_context_chars, fallback.as_deref())
    }

    /// Raw text of the only indexed document, when fallback is enabled.
    fn fallback_text(&self) -> Option<String> {
        let chars = self.settings.retrieval.fallback_chars;
        if chars == 0 {
            return None;
        }
        match self.index.list_documents().as_slice() {
            [only] => self.index.document_excerpt(&only.document_id, chars),
            _ => None,
        }
    }

    /// Recent complete history ending with `pending`, the not yet
    /// persisted user message.
    async fn history(
        &self,
        conversation_id: &str,
        pending: &ChatMessage,
    ) -> Result<Vec<ChatMessage>, PipelineError> {
        let mut messages = self.messages(conversation_id).await?;
        messages.retain(|m| m.is_complete);
        messages.push(pending.clone());
        let limit = self.settings.prompt.history_limit.max(1);
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }
}

fn complete(message: &mut ChatMessage, stats: &GenerationStats) {
    message.is_complete = true;
    message.tokens_generated = stats.tokens_generated;
    message.generation_time_ms = stats.elapsed_ms;
}

/// A running chat turn.
pub struct TurnHandle {
    message: watch::Receiver<ChatMessage>,
    cancel: CancelFlag,
    task: JoinHandle<Result<ChatMessage, PipelineError>>,
}

impl TurnHandle {
    /// Live view of the assistant message being generated.
    pub fn message(&self) -> watch::Receiver<ChatMessage> {
        self.message.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the turn to finish; returns the persisted assistant message.
    pub async fn wait(self) -> Result<ChatMessage, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?
    }
}
