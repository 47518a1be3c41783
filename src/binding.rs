//! The process-wide model handle
//!
//! Android and iOS both expose the same three calls: load, generate, unload.
//! They share one `Binding` guarded by a mutex. Results cross the boundary as
//! a bool or a string; failures are logged and turned into `false` or an
//! `"Error: "` string, never propagated to the host as exceptions.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::inference::{InferenceBackend, LlamaEngine, LoadedModelInfo};
use crate::storage::settings::load_settings;

/// Returned by generate when nothing is loaded
pub const MODEL_NOT_LOADED: &str = "Error: Model not loaded";

/// Returned by generate when the host's prompt string cannot be read
pub const PROMPT_UNREADABLE: &str = "Error: Failed to get prompt string";

/// A binding shared between host threads
pub type Shared<B> = Arc<Mutex<Binding<B>>>;

static GLOBAL: Lazy<Shared<LlamaEngine>> = Lazy::new(|| {
    let settings = load_settings();
    tracing::debug!("Creating global binding with {:?}", settings);
    Arc::new(Mutex::new(Binding::new(LlamaEngine::new(settings))))
});

/// Formats a failure the way the host expects to see it
pub fn error_string(reason: impl Display) -> String {
    format!("Error: {reason}")
}

/// State behind the three host entry points
pub struct Binding<B> {
    backend: B,
    loaded: Option<LoadedModelInfo>,
}

impl<B: InferenceBackend> Binding<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            loaded: None,
        }
    }

    pub fn shared(backend: B) -> Shared<B> {
        Arc::new(Mutex::new(Self::new(backend)))
    }

    /// Loads the model at `model_path`; `false` on any failure
    pub fn load_model(&mut self, model_path: &str) -> bool {
        tracing::info!("Loading model: {}", model_path);

        // A failed load leaves nothing loaded, even if a model was before
        self.loaded = None;
        match self.backend.load(Path::new(model_path)) {
            Ok(info) => {
                tracing::info!("Model loaded successfully");
                self.loaded = Some(info);
                true
            }
            Err(e) => {
                tracing::error!("Error loading model: {}", e);
                false
            }
        }
    }

    /// Generates a completion for `prompt`
    ///
    /// Never fails: errors come back as `"Error: <reason>"`.
    pub fn generate_text(&mut self, prompt: &str, max_tokens: i32) -> String {
        if self.loaded.is_none() {
            return MODEL_NOT_LOADED.to_string();
        }

        tracing::info!("Generating text for prompt: {}", prompt);

        let max_tokens = if max_tokens > 0 {
            max_tokens as u32
        } else {
            self.backend.default_max_tokens()
        };

        match self.backend.generate(prompt, max_tokens) {
            Ok(text) => {
                tracing::info!("Text generated successfully");
                text
            }
            Err(e) => {
                tracing::error!("Error generating text: {}", e);
                error_string(e)
            }
        }
    }

    /// Releases the model; does nothing when none is loaded
    pub fn unload_model(&mut self) {
        if self.loaded.take().is_some() {
            self.backend.unload();
            tracing::info!("Model unloaded successfully");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.loaded.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Locks a shared binding, recovering from a poisoned mutex
///
/// A panic inside llama.cpp glue poisons the lock; the state it protects is
/// still consistent (at worst "nothing loaded"), so later calls carry on.
pub fn lock<B>(binding: &Mutex<Binding<B>>) -> MutexGuard<'_, Binding<B>> {
    binding.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The binding used by the JNI and C entry points
pub fn global() -> Shared<LlamaEngine> {
    Arc::clone(&GLOBAL)
}

/// Runs `f`, turning a panic into `fallback`
///
/// Unwinding across `extern "C"` / JNI frames aborts the host process.
pub(crate) fn guarded<T>(operation: &str, fallback: impl FnOnce() -> T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Panic during {}: {}", operation, reason);
            fallback()
        }
    }
}

/// Load entry point shared by every host surface
pub fn load_model(model_path: &str) -> bool {
    guarded("loadModel", || false, || lock(&GLOBAL).load_model(model_path))
}

/// Generate entry point shared by every host surface
pub fn generate_text(prompt: &str, max_tokens: i32) -> String {
    guarded(
        "generateText",
        || error_string("internal error while generating"),
        || lock(&GLOBAL).generate_text(prompt, max_tokens),
    )
}

/// Generate for a host whose prompt string may not be readable
///
/// The loaded check runs before `read_prompt`, so a host passing a bad string
/// with no model loaded still hears about the missing model.
pub fn generate_from_host<B: InferenceBackend>(
    binding: &Mutex<Binding<B>>,
    read_prompt: impl FnOnce() -> Option<String>,
    max_tokens: i32,
) -> String {
    guarded(
        "generateText",
        || error_string("internal error while generating"),
        || {
            let mut binding = lock(binding);
            if !binding.is_loaded() {
                return MODEL_NOT_LOADED.to_string();
            }
            match read_prompt() {
                Some(prompt) => binding.generate_text(&prompt, max_tokens),
                None => PROMPT_UNREADABLE.to_string(),
            }
        },
    )
}

/// Unload entry point shared by every host surface
pub fn unload_model() {
    guarded("unloadModel", || (), || lock(&GLOBAL).unload_model())
}
