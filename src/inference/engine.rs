//! Inference engine implementation
//!
//! Core logic for managing llama-cpp context and running inference.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, the model is loaded and all inference runs
//! on a dedicated worker thread. Callers communicate via channels. The worker
//! handles one command at a time, so concurrent generations are serialized.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;

use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::streaming::StreamToken;
use crate::types::message::Message;
use crate::types::model::ModelParams;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Prompt handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Raw completion text, no template applied
    Text(String),
    /// Chat history rendered through the model's chat template
    Chat(Vec<Message>),
}

/// A single generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    /// Maximum number of tokens to generate (0 = only process the prompt)
    pub max_tokens: u32,
    /// Temperature for sampling (below 0.01 = greedy)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

/// Anything that can turn a request into a stream of tokens
///
/// The llama engine is the production implementation; tests script their own.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> Result<Receiver<StreamToken>, EngineError>;
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        request: GenerationRequest,
        token_tx: Sender<StreamToken>,
    },
    Shutdown,
}

/// The LLM inference engine using llama-cpp-2
///
/// Owns a worker thread that holds the backend and the loaded model for the
/// lifetime of the engine.
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Model info reported by the worker after load
    model_info: LoadedModelInfo,
}

impl LlamaEngine {
    /// Loads a GGUF model and starts the worker thread
    ///
    /// Blocks until the model is loaded. Any error here is a startup failure.
    pub fn load(params: ModelParams) -> Result<Self, EngineError> {
        // Validate GGUF file first (on caller thread, just file I/O)
        let metadata = validate_gguf(&params.path)?;
        tracing::debug!(
            "GGUF validation passed for {:?} (v{}, {} tensors)",
            params.path,
            metadata.version,
            metadata.tensor_count
        );

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<LoadedModelInfo, EngineError>>();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(params, command_rx, ready_tx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(e) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError(e.to_string()));
            }
        };

        tracing::info!("LlamaEngine worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            model_info,
        })
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.model_info
    }
}

impl TextGenerator for LlamaEngine {
    /// Queues a generation on the worker thread and returns its token channel
    fn generate(&self, request: GenerationRequest) -> Result<Receiver<StreamToken>, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("engine is shut down".to_string()))?;

        let (token_tx, token_rx) = mpsc::channel();

        command_tx
            .send(WorkerCommand::Generate { request, token_tx })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok(token_rx)
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Loads the backend and model, reports readiness, then processes commands.
fn worker_thread_main(
    params: ModelParams,
    command_rx: Receiver<WorkerCommand>,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
) {
    let (backend, model) = match load_model_internal(&params) {
        Ok((backend, model, info)) => {
            let _ = ready_tx.send(Ok(info));
            (backend, model)
        }
        Err(e) => {
            tracing::error!("Model load failed in worker thread: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate { request, token_tx }) => {
                if let Err(e) = run_generation(&backend, &model, &params, request, &token_tx) {
                    tracing::warn!("Generation failed: {}", e);
                    let _ = token_tx.send(StreamToken::Error(e));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Initialize the backend and load the model (worker thread only)
fn load_model_internal(
    params: &ModelParams,
) -> Result<(LlamaBackend, LlamaModel, LoadedModelInfo), EngineError> {
    let backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
    tracing::info!("LlamaBackend initialized in worker thread");

    let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers());
    let model = LlamaModel::load_from_file(&backend, &params.path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: params.path.to_string_lossy().to_string(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} train ctx)",
        info.path,
        info.param_count,
        model.n_vocab(),
        info.context_length
    );

    Ok((backend, model, info))
}

/// Run text generation (called from worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    params: &ModelParams,
    request: GenerationRequest,
    tx: &Sender<StreamToken>,
) -> Result<(), String> {
    let prompt = match &request.prompt {
        Prompt::Text(text) => text.clone(),
        Prompt::Chat(messages) => match build_chat_prompt(model, messages) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                plain_transcript(messages)
            }
        },
    };

    let n_ctx = if params.n_ctx == 0 {
        model.n_ctx_train()
    } else {
        params.n_ctx
    };
    let n_ctx = NonZeroU32::new(n_ctx).ok_or("Context size must be positive")?;

    let mut ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(params.n_batch);
    if let Some(threads) = params.n_threads {
        let threads = i32::try_from(threads).unwrap_or(i32::MAX);
        ctx_params = ctx_params
            .with_n_threads(threads)
            .with_n_threads_batch(threads);
    }

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;

    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    if tokens.is_empty() {
        return Err("Prompt produced no tokens".to_string());
    }
    if tokens.len() >= n_ctx.get() as usize {
        return Err(format!(
            "Prompt is {} tokens, context holds {}",
            tokens.len(),
            n_ctx.get()
        ));
    }

    run_inference(&mut ctx, model, tokens, params.n_batch, n_ctx.get(), request, tx)
}

fn build_chat_prompt(model: &LlamaModel, messages: &[Message]) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let chat = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &chat, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Fallback rendering for models without an embedded chat template
pub(crate) fn plain_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(message.role.as_str());
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str("assistant:");
    out
}

/// Runs the inference loop
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<LlamaToken>,
    n_batch: u32,
    n_ctx: u32,
    request: GenerationRequest,
    tx: &Sender<StreamToken>,
) -> Result<(), String> {
    let chunk_size = n_batch.max(1) as usize;
    let mut batch = LlamaBatch::new(chunk_size, 1);

    // Process prompt in n_batch sized chunks; only the last token needs logits
    let last_index = prompt_tokens.len() - 1;
    for (chunk_index, chunk) in prompt_tokens.chunks(chunk_size).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * chunk_size + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last_index)
                .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
    }

    let seed = resolve_seed(request.seed);

    let mut sampler = if request.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_p(request.top_p, 1),
            LlamaSampler::temp(request.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut n_generated = 0u32;

    // Buffer for handling incomplete UTF-8 sequences
    let mut utf8_buffer: Vec<u8> = Vec::new();

    for _ in 0..request.max_tokens {
        if n_decoded as u32 >= n_ctx {
            tracing::debug!("Context window full after {} tokens", n_decoded);
            break;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;
        utf8_buffer.extend_from_slice(&token_bytes);
        n_generated += 1;

        if let Some(text) = take_valid_utf8(&mut utf8_buffer) {
            if tx.send(StreamToken::Token(text)).is_err() {
                // Nobody is left to read the output
                tracing::debug!("Receiver dropped, stopping generation");
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;

        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;

        n_decoded += 1;
    }

    // Flush any remaining UTF-8 buffer before completion
    if !utf8_buffer.is_empty() {
        tracing::debug!("Flushing {} trailing bytes", utf8_buffer.len());
        let s = String::from_utf8_lossy(&utf8_buffer).into_owned();
        let _ = tx.send(StreamToken::Token(s));
    }

    tracing::info!("Generation finished: {} tokens", n_generated);
    let _ = tx.send(StreamToken::Done);

    Ok(())
}

/// Removes and returns the longest valid UTF-8 prefix of `buffer`
///
/// Bytes of an incomplete trailing sequence stay in the buffer.
pub(crate) fn take_valid_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    let valid_len = match std::str::from_utf8(buffer.as_slice()) {
        Ok(_) => buffer.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes that can never complete: emit them lossily
        Err(_) => buffer.len(),
    };

    if valid_len == 0 {
        return None;
    }

    let rest = buffer.split_off(valid_len);
    let text = String::from_utf8_lossy(buffer).into_owned();
    *buffer = rest;
    Some(text)
}

/// A requested seed of 0 means "pick one at random"
fn resolve_seed(requested: u32) -> u32 {
    if requested == 0 {
        rand::random::<u32>()
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    #[test]
    fn test_take_valid_utf8_complete() {
        let mut buf = "héllo".as_bytes().to_vec();
        assert_eq!(take_valid_utf8(&mut buf).as_deref(), Some("héllo"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_valid_utf8_keeps_incomplete_suffix() {
        // "好" is e5 a5 bd
        let mut buf = vec![b'a', 0xe5, 0xa5];
        assert_eq!(take_valid_utf8(&mut buf).as_deref(), Some("a"));
        assert_eq!(buf, vec![0xe5, 0xa5]);

        buf.push(0xbd);
        assert_eq!(take_valid_utf8(&mut buf).as_deref(), Some("好"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_valid_utf8_only_partial() {
        let mut buf = vec![0xe5];
        assert!(take_valid_utf8(&mut buf).is_none());
        assert_eq!(buf, vec![0xe5]);
    }

    #[test]
    fn test_plain_transcript() {
        let messages = vec![
            Message::new(Role::System, "You are TARS."),
            Message::new(Role::User, "hi"),
        ];
        assert_eq!(
            plain_transcript(&messages),
            "system: You are TARS.\nuser: hi\nassistant:"
        );
    }

    #[test]
    fn test_load_missing_model_fails_fast() {
        let params = ModelParams {
            path: "/no/such/model.gguf".into(),
            n_ctx: 4096,
            n_gpu_layers: 0,
            n_batch: 512,
            n_threads: None,
        };
        let err = LlamaEngine::load(params).err().unwrap();
        assert!(matches!(err, EngineError::ModelValidation(_)));
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(42), 42);

        let drawn: std::collections::HashSet<u32> = (0..16).map(|_| resolve_seed(0)).collect();
        assert!(drawn.len() > 1);
    }
}
