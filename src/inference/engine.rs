//! Inference engine implementation
//!
//! Core logic for driving llama.cpp through `llama-cpp-2`.
//!
//! # Architecture
//!
//! `LlamaBackend`, `LlamaModel` and `LlamaContext` hold raw pointers and are
//! not `Send`, while JNI calls arrive on whatever thread the host picks. All
//! llama.cpp objects therefore live on one dedicated worker thread and the
//! engine talks to it over channels. The engine itself is `Send` and can sit
//! behind the global mutex.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
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

use crate::inference::model::{has_gguf_extension, read_gguf_header, ModelError};
use crate::inference::streaming::{StreamToken, Utf8Assembler};
use crate::inference::InferenceBackend;
use crate::storage::settings::InferenceSettings;

/// Smallest context window we will create, whatever the settings say
const MIN_CONTEXT: u32 = 2048;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Model not loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Invalid model file: {0}")]
    ModelValidation(String),

    #[error("Prompt too long: {tokens} tokens for a context of {context}")]
    ContextOverflow { tokens: usize, context: u32 },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Per-request generation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// Requested context window size
    pub context_size: u32,
    /// Prompt decode batch size
    pub n_batch: u32,
    /// Apply the model's chat template to the prompt
    pub use_chat_template: bool,
}

impl GenerationParams {
    pub fn from_settings(settings: &InferenceSettings, max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: settings.temperature,
            top_k: settings.top_k,
            top_p: settings.top_p,
            seed: settings.seed,
            context_size: settings.context_size,
            n_batch: settings.n_batch,
            use_chat_template: settings.use_chat_template,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        let settings = InferenceSettings::default();
        Self::from_settings(&settings, settings.max_tokens)
    }
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Init {
        response_tx: Sender<Result<(), EngineError>>,
    },
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    UnloadModel,
    Generate {
        prompt: String,
        params: GenerationParams,
        token_tx: Sender<StreamToken>,
        stop_signal: Arc<AtomicBool>,
    },
    Shutdown,
}

/// The llama.cpp engine
///
/// Uses a dedicated worker thread for all llama-cpp operations since
/// the underlying types are not Send.
pub struct LlamaEngine {
    settings: InferenceSettings,
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info (updated after load)
    model_info: Option<LoadedModelInfo>,
}

impl LlamaEngine {
    /// Creates an engine; no thread is started until the first load
    pub fn new(settings: InferenceSettings) -> Self {
        Self {
            settings,
            command_tx: None,
            worker_handle: None,
            model_info: None,
        }
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    /// Starts the worker thread and initializes the llama.cpp backend
    ///
    /// Idempotent. The backend can only be initialized once per process, so a
    /// failure here is reported to every later caller as well.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.command_tx.is_some() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Init { response_tx })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.command_tx = Some(command_tx);
        self.worker_handle = Some(handle);

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        tracing::info!("LlamaEngine worker thread started");
        Ok(())
    }

    /// Loads a GGUF model, replacing any model already loaded
    ///
    /// The header is checked before llama.cpp is touched, so a bad path
    /// fails without starting the worker.
    pub fn load_model<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadedModelInfo, EngineError> {
        let path = path.as_ref();

        if !has_gguf_extension(path) {
            tracing::warn!("{} does not end in .gguf, checking header anyway", path.display());
        }
        let header = read_gguf_header(path)?;
        tracing::debug!(
            "GGUF v{} header ok: {} tensors, {} metadata keys",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        self.init()?;
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        // The worker drops the old model before reading the new one
        self.model_info = None;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                gpu_layers: self.settings.gpu_layers,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let info = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.model_info = Some(info.clone());
        Ok(info)
    }

    /// Unloads the current model and frees its memory
    pub fn unload_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::UnloadModel);
        }
        self.model_info = None;
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model_info.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Starts a generation and returns the token stream plus its stop flag
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<(Receiver<StreamToken>, Arc<AtomicBool>), EngineError> {
        if self.model_info.is_none() {
            return Err(EngineError::NoModelLoaded);
        }
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        let (token_tx, token_rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));

        command_tx
            .send(WorkerCommand::Generate {
                prompt: prompt.to_string(),
                params,
                token_tx,
                stop_signal: stop_signal.clone(),
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok((token_rx, stop_signal))
    }

    /// Runs a generation to completion and returns the whole text
    pub fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String, EngineError> {
        let (tokens, _stop) = self.generate_stream(prompt, params)?;
        collect_stream(tokens)
    }
}

/// Drains a token stream into one string
pub(crate) fn collect_stream(tokens: Receiver<StreamToken>) -> Result<String, EngineError> {
    let mut text = String::new();
    for token in tokens {
        match token {
            StreamToken::Token(piece) => text.push_str(&piece),
            StreamToken::Done => return Ok(text),
            StreamToken::Error(e) => return Err(e),
        }
    }
    Err(EngineError::WorkerError(
        "worker stopped before finishing the generation".to_string(),
    ))
}

impl InferenceBackend for LlamaEngine {
    fn load(&mut self, path: &Path) -> Result<LoadedModelInfo, EngineError> {
        self.load_model(path)
    }

    fn generate(&mut self, prompt: &str, max_tokens: u32) -> Result<String, EngineError> {
        let params = GenerationParams::from_settings(&self.settings, max_tokens);
        LlamaEngine::generate(self, prompt, params)
    }

    fn unload(&mut self) {
        self.unload_model();
    }

    fn default_max_tokens(&self) -> u32 {
        self.settings.max_tokens
    }

    fn default_model(&self) -> &str {
        &self.settings.default_model
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from the engine.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut model: Option<LlamaModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init { response_tx }) => {
                let result = match LlamaBackend::init() {
                    Ok(b) => {
                        backend = Some(b);
                        tracing::info!("LlamaBackend initialized in worker thread");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Failed to init backend: {}", e);
                        Err(EngineError::BackendInit(e.to_string()))
                    }
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            }) => {
                // Free the old weights first; phones cannot hold two models
                model = None;
                let result = match &backend {
                    Some(b) => load_model_internal(b, &path, gpu_layers).map(|(m, info)| {
                        model = Some(m);
                        info
                    }),
                    None => Err(EngineError::BackendNotInitialized),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel) => {
                if model.take().is_some() {
                    tracing::info!("Model unloaded in worker thread");
                }
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                token_tx,
                stop_signal,
            }) => {
                if let (Some(b), Some(m)) = (&backend, &model) {
                    if let Err(e) = run_generation(b, m, &prompt, params, &token_tx, &stop_signal) {
                        tracing::error!("Generation failed: {}", e);
                        let _ = token_tx.send(StreamToken::Error(e));
                    }
                } else {
                    let _ = token_tx.send(StreamToken::Error(EngineError::NoModelLoaded));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_model_internal(
    backend: &LlamaBackend,
    path: &Path,
    gpu_layers: u32,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length
    );

    Ok((model, info))
}

/// Context window actually created for a request
fn context_window(requested: u32, trained: u32) -> u32 {
    std::cmp::max(std::cmp::min(requested, trained), MIN_CONTEXT)
}

/// Rejects prompts that leave no room in the context to generate
fn check_prompt_fits(tokens: usize, n_ctx: u32) -> Result<(), EngineError> {
    if tokens >= n_ctx as usize {
        return Err(EngineError::ContextOverflow {
            tokens,
            context: n_ctx,
        });
    }
    Ok(())
}

/// Run text generation (called from worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: GenerationParams,
    tx: &Sender<StreamToken>,
    stop_signal: &Arc<AtomicBool>,
) -> Result<(), EngineError> {
    let prompt = if params.use_chat_template {
        match build_chat_prompt(model, prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                prompt.to_string()
            }
        }
    } else {
        prompt.to_string()
    };

    let n_ctx = context_window(params.context_size, model.n_ctx_train());
    let n_batch = params.n_batch.max(1);

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(n_batch);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::Inference(format!("Failed to create context: {}", e)))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| EngineError::Inference(format!("Failed to tokenize: {}", e)))?;

    if tokens.is_empty() {
        return Err(EngineError::Inference("Prompt produced no tokens".to_string()));
    }
    check_prompt_fits(tokens.len(), n_ctx)?;

    tracing::debug!("Tokenized prompt into {} tokens (ctx {})", tokens.len(), n_ctx);

    run_inference(&mut ctx, model, &tokens, n_ctx, &params, tx, stop_signal)
        .map_err(EngineError::Inference)
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    if params.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k as i32),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Decodes the prompt, then samples until EOG, the token limit, a full
/// context, the stop flag, or a dropped receiver
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: &[LlamaToken],
    n_ctx: u32,
    params: &GenerationParams,
    tx: &Sender<StreamToken>,
    stop_signal: &Arc<AtomicBool>,
) -> Result<(), String> {
    let n_batch = params.n_batch.max(1) as usize;
    let mut batch = LlamaBatch::new(n_batch, 1);

    // Prompts longer than one batch are decoded chunk by chunk
    let last = prompt_tokens.len() - 1;
    for (chunk_idx, chunk) in prompt_tokens.chunks(n_batch).enumerate() {
        batch.clear();
        for (i, token) in chunk.iter().enumerate() {
            let pos = chunk_idx * n_batch + i;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
    }

    let mut sampler = build_sampler(params);
    let mut n_decoded = prompt_tokens.len() as i32;
    let mut text = Utf8Assembler::new();

    for _ in 0..params.max_tokens {
        if stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by caller");
            break;
        }
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

        if let Some(piece) = text.push(&token_bytes) {
            if tx.send(StreamToken::Token(piece)).is_err() {
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

    if let Some(rest) = text.finish() {
        let _ = tx.send(StreamToken::Token(rest));
    }
    let _ = tx.send(StreamToken::Done);

    tracing::debug!(
        "Generated {} tokens",
        n_decoded - prompt_tokens.len() as i32
    );
    Ok(())
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model::tests::{header_bytes, write_fake_model};
    use crate::inference::model::GGUF_MAGIC;

    #[test]
    fn test_engine_new() {
        let engine = LlamaEngine::new(InferenceSettings::default());
        assert!(!engine.is_initialized());
        assert!(!engine.is_model_loaded());
        assert!(engine.model_info().is_none());
    }

    #[test]
    fn test_generation_params_follow_settings() {
        let settings = InferenceSettings {
            temperature: 0.0,
            top_k: 20,
            seed: 7,
            ..InferenceSettings::default()
        };
        let params = GenerationParams::from_settings(&settings, 64);

        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.top_k, 20);
        assert_eq!(params.seed, 7);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(GenerationParams::default().max_tokens, 512);
    }

    #[test]
    fn test_context_window() {
        assert_eq!(context_window(4096, 32768), 4096);
        assert_eq!(context_window(8192, 4096), 4096);
        assert_eq!(context_window(512, 4096), MIN_CONTEXT);
    }

    #[test]
    fn test_unload_without_model() {
        let mut engine = LlamaEngine::new(InferenceSettings::default());
        engine.unload_model();
        assert!(!engine.is_model_loaded());
    }

    #[test]
    fn test_generate_without_model() {
        let engine = LlamaEngine::new(InferenceSettings::default());
        let result = engine.generate("hello", GenerationParams::default());
        assert_eq!(result, Err(EngineError::NoModelLoaded));
    }

    #[test]
    fn test_bad_file_rejected_before_backend_starts() {
        let mut engine = LlamaEngine::new(InferenceSettings::default());
        let file = write_fake_model(&header_bytes(0x12345678, 3));

        let result = engine.load_model(file.path());

        assert!(matches!(result, Err(EngineError::ModelValidation(_))));
        assert!(!engine.is_initialized());
        assert!(!engine.is_model_loaded());

        let truncated = write_fake_model(&GGUF_MAGIC.to_le_bytes());
        assert!(matches!(
            engine.load_model(truncated.path()),
            Err(EngineError::ModelValidation(_))
        ));
    }

    #[test]
    fn test_collect_stream() {
        let (tx, rx) = mpsc::channel();
        tx.send(StreamToken::Token("Hola".to_string())).unwrap();
        tx.send(StreamToken::Token(", mundo".to_string())).unwrap();
        tx.send(StreamToken::Done).unwrap();
        assert_eq!(collect_stream(rx).unwrap(), "Hola, mundo");

        let (tx, rx) = mpsc::channel();
        tx.send(StreamToken::Token("partial".to_string())).unwrap();
        tx.send(StreamToken::Error(EngineError::Inference(
            "Failed to decode: -1".to_string(),
        )))
        .unwrap();
        assert_eq!(
            collect_stream(rx),
            Err(EngineError::Inference("Failed to decode: -1".to_string()))
        );

        let (tx, rx) = mpsc::channel::<StreamToken>();
        drop(tx);
        assert!(matches!(collect_stream(rx), Err(EngineError::WorkerError(_))));
    }

    #[test]
    fn test_prompt_overflow_keeps_its_type() {
        assert_eq!(check_prompt_fits(2047, 2048), Ok(()));

        let overflow = check_prompt_fits(3000, 2048).unwrap_err();
        assert_eq!(
            overflow,
            EngineError::ContextOverflow {
                tokens: 3000,
                context: 2048
            }
        );

        // What the worker sends must come out of `generate` unchanged
        let (tx, rx) = mpsc::channel();
        tx.send(StreamToken::Error(overflow.clone())).unwrap();
        assert_eq!(collect_stream(rx), Err(overflow));
    }

    #[test]
    fn test_backend_defaults_follow_settings() {
        let engine = LlamaEngine::new(InferenceSettings {
            max_tokens: 128,
            default_model: "phi-2.Q4_K_M.gguf".to_string(),
            ..InferenceSettings::default()
        });
        assert_eq!(InferenceBackend::default_max_tokens(&engine), 128);
        assert_eq!(InferenceBackend::default_model(&engine), "phi-2.Q4_K_M.gguf");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(EngineError::NoModelLoaded.to_string(), "Model not loaded");
        assert_eq!(
            EngineError::ContextOverflow {
                tokens: 3000,
                context: 2048
            }
            .to_string(),
            "Prompt too long: 3000 tokens for a context of 2048"
        );
    }
}
