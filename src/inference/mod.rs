//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp for model loading and inference.

use std::path::Path;

pub mod engine;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{EngineError, GenerationParams, LlamaEngine, LoadedModelInfo};
pub use model::{has_gguf_extension, read_gguf_header, GgufHeader, ModelError, GGUF_MAGIC};
pub use streaming::{StreamToken, Utf8Assembler};

/// What the binding needs from an inference library
///
/// `LlamaEngine` is the real implementation; the binding and host module are
/// written against this trait so they can be exercised without model weights.
pub trait InferenceBackend: Send {
    /// Loads the model at `path`, replacing any model already loaded
    fn load(&mut self, path: &Path) -> Result<LoadedModelInfo, EngineError>;

    /// Generates a completion of at most `max_tokens` tokens
    fn generate(&mut self, prompt: &str, max_tokens: u32) -> Result<String, EngineError>;

    /// Releases the loaded model, if any
    fn unload(&mut self);

    /// Token limit used when the host does not give a positive one
    fn default_max_tokens(&self) -> u32;

    /// Model file the host module loads when it is not told otherwise
    fn default_model(&self) -> &str;
}
