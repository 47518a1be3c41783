//! Test doubles shared by the unit tests

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::inference::{EngineError, InferenceBackend, LoadedModelInfo};
use crate::storage::settings::DEFAULT_MODEL_NAME;

/// Backend that echoes prompts and records every call
///
/// Paths containing "broken" fail to load.
pub(crate) struct FakeBackend {
    calls: Arc<Mutex<Vec<String>>>,
    pub generate_error: Option<EngineError>,
    pub panic_on_generate: bool,
    pub default_model: String,
}

impl FakeBackend {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let backend = Self {
            calls: Arc::clone(&calls),
            generate_error: None,
            panic_on_generate: false,
            default_model: DEFAULT_MODEL_NAME.to_string(),
        };
        (backend, calls)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl InferenceBackend for FakeBackend {
    fn load(&mut self, path: &Path) -> Result<LoadedModelInfo, EngineError> {
        let path = path.to_string_lossy().to_string();
        self.record(format!("load {}", path));

        if path.contains("broken") {
            return Err(EngineError::ModelLoad("null result from llama cpp".to_string()));
        }
        Ok(LoadedModelInfo {
            path,
            vocab_size: 32000,
            embedding_dim: 4096,
            context_length: 4096,
            param_count: 6_738_415_616,
            size_bytes: 4_783_156_928,
        })
    }

    fn generate(&mut self, prompt: &str, max_tokens: u32) -> Result<String, EngineError> {
        self.record(format!("generate {} {}", prompt, max_tokens));

        if self.panic_on_generate {
            panic!("fake backend exploded");
        }
        match &self.generate_error {
            Some(e) => Err(e.clone()),
            None => Ok(format!("{} [{}]", prompt, max_tokens)),
        }
    }

    fn unload(&mut self) {
        self.record("unload".to_string());
    }

    fn default_max_tokens(&self) -> u32 {
        512
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
