//! Host-facing module
//!
//! The mobile app never calls the raw binding directly. It goes through a
//! promise-based module that resolves the model file out of the app's bundled
//! assets, serialises work onto one background thread and maps outcomes to
//! error codes the UI can switch on.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::binding::{self, Shared};
use crate::inference::{InferenceBackend, LlamaEngine};
use crate::storage::assets::{copy_model_from_assets_if_needed, AssetSource};
use crate::storage::{self, StorageError};

/// Name the module is registered under in the host runtime
pub const NAME: &str = "LlamaModule";

pub const LOAD_ERROR: &str = "LOAD_ERROR";
pub const MODEL_NOT_LOADED: &str = "MODEL_NOT_LOADED";
pub const GENERATION_ERROR: &str = "GENERATION_ERROR";

pub const MSG_MODEL_LOADED: &str = "Model loaded successfully";
pub const MSG_MODEL_UNLOADED: &str = "Model unloaded successfully";
pub const MSG_NO_MODEL: &str = "No model loaded";

/// `instance` value when there is no inference instance
const NO_INSTANCE: u64 = 0;

/// Rejection delivered to a promise
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ModuleError {
    pub code: &'static str,
    pub message: String,
}

impl ModuleError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Completion handle for one host call
pub trait Promise: Send + 'static {
    fn resolve(self, value: String);
    fn reject(self, error: ModuleError);
}

impl Promise for Sender<Result<String, ModuleError>> {
    fn resolve(self, value: String) {
        let _ = self.send(Ok(value));
    }

    fn reject(self, error: ModuleError) {
        let _ = self.send(Err(error));
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// One background thread running jobs in submission order
struct SerialExecutor {
    job_tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SerialExecutor {
    fn new(name: &str) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in job_rx {
                // A panicking job must not take the queue down with it
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Module job panicked");
                }
            }
        })?;

        Ok(Self {
            job_tx: Some(job_tx),
            handle: Some(handle),
        })
    }

    fn execute(&self, job: Job) {
        let sent = self.job_tx.as_ref().map(|tx| tx.send(job).is_ok());
        if sent != Some(true) {
            tracing::error!("Module executor is gone, job dropped");
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        // Closing the channel lets queued jobs finish, then the loop ends
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Promise-based front end over a shared binding
pub struct LlamaModule<B: InferenceBackend + 'static> {
    binding: Shared<B>,
    assets: Arc<dyn AssetSource>,
    models_dir: PathBuf,
    default_model: String,
    /// Ticket of the load that created the current instance, or `NO_INSTANCE`
    instance: Arc<AtomicU64>,
    next_ticket: AtomicU64,
    executor: SerialExecutor,
}

impl LlamaModule<LlamaEngine> {
    /// Module over the process-wide binding used by JNI and the C ABI,
    /// unpacking models into the data directory
    pub fn with_global(assets: Arc<dyn AssetSource>) -> Result<Self, StorageError> {
        let models_dir = storage::models_dir()?;
        Ok(Self::new(binding::global(), assets, models_dir)?)
    }
}

impl<B: InferenceBackend + 'static> LlamaModule<B> {
    pub fn new(
        binding: Shared<B>,
        assets: Arc<dyn AssetSource>,
        models_dir: PathBuf,
    ) -> std::io::Result<Self> {
        let default_model = binding::lock(&binding).backend().default_model().to_string();
        Ok(Self {
            binding,
            assets,
            models_dir,
            default_model,
            instance: Arc::new(AtomicU64::new(NO_INSTANCE)),
            next_ticket: AtomicU64::new(NO_INSTANCE + 1),
            executor: SerialExecutor::new("llama-module")?,
        })
    }

    pub fn with_default_model(mut self, model_name: impl Into<String>) -> Self {
        self.default_model = model_name.into();
        self
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Unpacks `model_name` if needed and loads it in the background
    pub fn load_model<P: Promise>(&self, model_name: &str, promise: P) {
        let binding = Arc::clone(&self.binding);
        let assets = Arc::clone(&self.assets);
        let models_dir = self.models_dir.clone();
        let model_name = model_name.to_string();
        let instance = Arc::clone(&self.instance);

        // Calls queued behind this load must reach the binding, not be
        // rejected because the load has not started yet
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.instance.store(ticket, Ordering::SeqCst);

        self.executor.execute(Box::new(move || {
            let model_file =
                match copy_model_from_assets_if_needed(&models_dir, assets.as_ref(), &model_name) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!("Error loading model {}: {}", model_name, e);
                        // No instance without a model file, unless a later
                        // load or unload has already replaced this one
                        let _ = instance.compare_exchange(
                            ticket,
                            NO_INSTANCE,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        promise.reject(ModuleError::new(
                            LOAD_ERROR,
                            format!("Failed to load model: {e}"),
                        ));
                        return;
                    }
                };

            let loaded = binding::lock(&binding).load_model(&model_file.to_string_lossy());
            if loaded {
                promise.resolve(MSG_MODEL_LOADED.to_string());
            } else {
                promise.reject(ModuleError::new(LOAD_ERROR, "Failed to load model"));
            }
        }));
    }

    /// Loads the configured default model
    pub fn load_default_model<P: Promise>(&self, promise: P) {
        let name = self.default_model.clone();
        self.load_model(&name, promise);
    }

    /// Generates text in the background
    ///
    /// Resolves with whatever the binding returns, including its
    /// `"Error: ..."` strings; only a crash rejects.
    pub fn generate_text<P: Promise>(&self, prompt: &str, max_tokens: i32, promise: P) {
        if self.instance.load(Ordering::SeqCst) == NO_INSTANCE {
            promise.reject(ModuleError::new(
                MODEL_NOT_LOADED,
                "The model has not been loaded",
            ));
            return;
        }

        let binding = Arc::clone(&self.binding);
        let prompt = prompt.to_string();

        self.executor.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                binding::lock(&binding).generate_text(&prompt, max_tokens)
            }));
            match result {
                Ok(text) => promise.resolve(text),
                Err(_) => {
                    tracing::error!("Error generating text: generation panicked");
                    promise.reject(ModuleError::new(
                        GENERATION_ERROR,
                        "Failed to generate text: internal error",
                    ));
                }
            }
        }));
    }

    /// Releases the model once every call submitted before it has run
    pub fn unload_model<P: Promise>(&self, promise: P) {
        if self.instance.swap(NO_INSTANCE, Ordering::SeqCst) == NO_INSTANCE {
            promise.resolve(MSG_NO_MODEL.to_string());
            return;
        }

        let binding = Arc::clone(&self.binding);
        self.executor.execute(Box::new(move || {
            binding::lock(&binding).unload_model();
            promise.resolve(MSG_MODEL_UNLOADED.to_string());
        }));
    }
}
