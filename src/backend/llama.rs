//! llama.cpp backend via `llama-cpp-2`.
//!
//! llama.cpp state is not `Send`, so a dedicated worker thread owns the
//! backend handle and the loaded model. [`LlamaBackend`] forwards commands
//! over a channel and relays generated pieces back to the caller's sink.
//!
//! Every generation decodes into a fresh context, so the key/value cache
//! never carries over between requests and [`clear_cache`] has nothing to
//! reset.
//!
//! [`clear_cache`]: InferenceBackend::clear_cache

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend as NativeBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use localllm_core::models::GenerationConfig;

use super::{
    drain_utf8, InferenceBackend, LoadParams, ModelInfo, Sampling, StopReason, PENALTY_LAST_N,
};
use crate::cancel::CancelFlag;
use crate::error::NativeError;

enum Command {
    Load {
        path: PathBuf,
        params: LoadParams,
        reply: Sender<Result<ModelInfo, NativeError>>,
    },
    Unload,
    Generate {
        prompt: String,
        config: GenerationConfig,
        cancel: CancelFlag,
        stop: CancelFlag,
        pieces: Sender<Piece>,
    },
    Shutdown,
}

enum Piece {
    Text(String),
    Finished(Result<StopReason, NativeError>),
}

struct LoadedModel {
    model: LlamaModel,
    params: LoadParams,
}

pub struct LlamaBackend {
    commands: Mutex<Sender<Command>>,
    info: Mutex<Option<ModelInfo>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LlamaBackend {
    /// Start the worker thread and initialize llama.cpp on it.
    pub fn new() -> Result<Self, NativeError> {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_main(rx))
            .map_err(|e| NativeError::new(format!("failed to spawn llama worker: {e}")))?;
        Ok(Self {
            commands: Mutex::new(tx),
            info: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, command: Command) -> Result<(), NativeError> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(command)
            .map_err(|_| NativeError::new("llama worker is not running"))
    }

    fn set_info(&self, info: Option<ModelInfo>) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }
}

impl Drop for LlamaBackend {
    fn drop(&mut self) {
        let _ = self.send(Command::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl InferenceBackend for LlamaBackend {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<(), NativeError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Load {
            path: path.to_path_buf(),
            params: *params,
            reply,
        })?;
        let info = rx
            .recv()
            .map_err(|_| NativeError::new("llama worker exited during load"))??;
        self.set_info(Some(info));
        Ok(())
    }

    fn unload(&self) {
        self.set_info(None);
        if self.send(Command::Unload).is_err() {
            tracing::warn!("llama worker gone; nothing to unload");
        }
    }

    fn clear_cache(&self) {}

    fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StopReason, NativeError> {
        let stop = CancelFlag::new();
        let (pieces, rx) = mpsc::channel();
        self.send(Command::Generate {
            prompt: prompt.to_string(),
            config: config.clone(),
            cancel: cancel.clone(),
            stop: stop.clone(),
            pieces,
        })?;

        loop {
            match rx.recv() {
                Ok(Piece::Text(text)) => {
                    if !stop.is_cancelled() && !sink(&text) {
                        stop.cancel();
                    }
                }
                Ok(Piece::Finished(result)) => return result,
                Err(_) => return Err(NativeError::new("llama worker exited during generation")),
            }
        }
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn system_info(&self) -> String {
        let loaded = self
            .model_info()
            .map(|info| info.description)
            .unwrap_or_else(|| "no model".to_string());
        format!("llama.cpp via llama-cpp-2; loaded: {loaded}")
    }
}

fn worker_main(commands: Receiver<Command>) {
    let backend = match NativeBackend::init() {
        Ok(b) => Some(b),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize llama.cpp backend");
            None
        }
    };
    let mut loaded: Option<LoadedModel> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Load {
                path,
                params,
                reply,
            } => {
                loaded = None;
                let result = match &backend {
                    Some(b) => load_model(b, &path, params).map(|(model, info)| {
                        loaded = Some(LoadedModel { model, params });
                        info
                    }),
                    None => Err(NativeError::new("llama.cpp backend failed to initialize")),
                };
                let _ = reply.send(result);
            }
            Command::Unload => {
                if loaded.take().is_some() {
                    tracing::info!("model released");
                }
            }
            Command::Generate {
                prompt,
                config,
                cancel,
                stop,
                pieces,
            } => {
                let result = match (&backend, &loaded) {
                    (Some(b), Some(m)) => run_generation(b, m, &prompt, &config, &cancel, &stop, &pieces),
                    _ => Err(NativeError::new("Model not loaded")),
                };
                let _ = pieces.send(Piece::Finished(result));
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("llama worker exiting");
}

fn load_model(
    backend: &NativeBackend,
    path: &Path,
    params: LoadParams,
) -> Result<(LlamaModel, ModelInfo), NativeError> {
    let gpu_layers = if params.use_acceleration {
        params.gpu_layers
    } else {
        0
    };
    if !params.use_mmap || params.use_mlock {
        tracing::debug!(
            use_mmap = params.use_mmap,
            use_mlock = params.use_mlock,
            "memory mapping flags use llama.cpp defaults"
        );
    }
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    tracing::info!(path = %path.display(), gpu_layers, "loading GGUF model");
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| NativeError::new(format!("Failed to load model: {e}")))?;

    let description = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let info = ModelInfo {
        description,
        n_params: model.n_params() as u64,
        size_bytes: model.size() as u64,
        context_size: params.context_size.min(model.n_ctx_train()),
    };
    Ok((model, info))
}

fn run_generation(
    backend: &NativeBackend,
    loaded: &LoadedModel,
    prompt: &str,
    config: &GenerationConfig,
    cancel: &CancelFlag,
    stop: &CancelFlag,
    pieces: &Sender<Piece>,
) -> Result<StopReason, NativeError> {
    if prompt.trim().is_empty() {
        return Err(NativeError::new("Empty prompt"));
    }
    let model = &loaded.model;
    let params = loaded.params;

    let n_ctx = NonZeroU32::new(params.context_size)
        .ok_or_else(|| NativeError::new("Invalid context size"))?;
    let threads = params.threads as i32;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(params.batch_size.max(1))
        .with_n_threads(threads)
        .with_n_threads_batch(threads);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| NativeError::new(format!("Failed to create context: {e}")))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| NativeError::new(format!("Failed to tokenize prompt: {e}")))?;
    if tokens.is_empty() {
        return Err(NativeError::new("Empty prompt"));
    }
    let n_ctx = ctx.n_ctx() as i32;
    if tokens.len() as i32 >= n_ctx - 1 {
        return Err(NativeError::new("Prompt too long for context"));
    }

    let n_batch = params.batch_size.max(1) as usize;
    let mut batch = LlamaBatch::new(n_batch, 1);
    let last = tokens.len() - 1;
    for (offset, window) in tokens.chunks(n_batch).enumerate() {
        batch.clear();
        for (i, token) in window.iter().enumerate() {
            let pos = offset * n_batch + i;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| NativeError::new(format!("Failed to add token to batch: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| NativeError::new(format!("Failed to decode prompt: {e}")))?;
    }

    let sampling = Sampling::from_config(config);
    let mut sampler = LlamaSampler::chain_simple([
        LlamaSampler::penalties(PENALTY_LAST_N, sampling.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(sampling.top_k),
        LlamaSampler::top_p(sampling.top_p, 1),
        LlamaSampler::temp(sampling.temperature),
        LlamaSampler::dist(seed()),
    ]);

    let mut n_cur = tokens.len() as i32;
    let mut sampled = 0usize;
    let mut utf8 = Vec::new();

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if stop.is_cancelled() || sampled >= config.max_tokens {
            break StopReason::MaxTokens;
        }
        if n_cur >= n_ctx - 1 {
            break StopReason::ContextFull;
        }

        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);
        if model.is_eog_token(token) {
            break StopReason::EndOfGeneration;
        }
        sampled += 1;

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| NativeError::new(format!("Failed to detokenize: {e}")))?;
        utf8.extend_from_slice(&bytes);
        let text = drain_utf8(&mut utf8);
        if !text.is_empty() && pieces.send(Piece::Text(text)).is_err() {
            break StopReason::Cancelled;
        }

        batch.clear();
        batch
            .add(token, n_cur, &[0], true)
            .map_err(|e| NativeError::new(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| NativeError::new(format!("Failed to decode: {e}")))?;
        n_cur += 1;
    };

    if !utf8.is_empty() {
        let _ = pieces.send(Piece::Text(String::from_utf8_lossy(&utf8).into_owned()));
    }
    tracing::debug!(?reason, sampled, "llama generation finished");
    Ok(reason)
}

fn seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(42)
}
