//! Settings storage
//!
//! Inference settings read from `settings.json` in the data directory.
//! The host app owns the file and may never write it; every field has a sane
//! default.

use crate::storage::{data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model the host module loads when it is not told otherwise
pub const DEFAULT_MODEL_NAME: &str = "llama-2-7b-chat.Q5_K_M.gguf";

/// Tokens generated when the host passes a non-positive limit
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Inference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Number of layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Requested context window; clamped to what the model was trained on
    pub context_size: u32,
    /// Logical batch size used while decoding the prompt
    pub n_batch: u32,
    /// Temperature for sampling (below 0.01 switches to greedy)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Sampling seed (0 = random per request)
    pub seed: u32,
    /// Tokens generated when the host does not give a positive limit
    pub max_tokens: u32,
    /// Wrap prompts in the model's chat template when it has one
    pub use_chat_template: bool,
    /// Model file the host module loads by default
    pub default_model: String,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            // Phones rarely have a usable GPU path; keep the default on the CPU
            gpu_layers: 0,
            context_size: 2048,
            n_batch: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
            max_tokens: DEFAULT_MAX_TOKENS,
            use_chat_template: true,
            default_model: DEFAULT_MODEL_NAME.to_string(),
        }
    }
}

impl InferenceSettings {
    /// Clamp values into the ranges llama.cpp accepts
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        if self.context_size == 0 {
            self.context_size = 2048;
        }
        if self.n_batch == 0 {
            self.n_batch = 512;
        }
        if self.default_model.trim().is_empty() {
            self.default_model = DEFAULT_MODEL_NAME.to_string();
        }
    }
}

fn settings_path() -> Result<PathBuf, StorageError> {
    Ok(data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns defaults if the file doesn't exist or is corrupted
pub fn load_settings() -> InferenceSettings {
    match settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            InferenceSettings::default()
        }
    }
}

/// Load settings from an explicit file
pub fn load_settings_from(path: &Path) -> Result<InferenceSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found at {}, using defaults", path.display());
        return Ok(InferenceSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: InferenceSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = InferenceSettings::default();
        assert_eq!(settings.gpu_layers, 0);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.default_model, "llama-2-7b-chat.Q5_K_M.gguf");
        assert!(settings.use_chat_template);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = InferenceSettings {
            temperature: 5.0,
            top_p: 2.0,
            top_k: 0,
            max_tokens: 0,
            context_size: 0,
            n_batch: 0,
            default_model: "  ".to_string(),
            ..InferenceSettings::default()
        };
        settings.validate();

        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.n_batch, 512);
        assert_eq!(settings.default_model, DEFAULT_MODEL_NAME);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "gpu_layers": 99, "temperature": 0.2 }"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.gpu_layers, 99);
        assert_eq!(settings.temperature, 0.2);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, InferenceSettings::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_settings_from(&path), Err(StorageError::JsonError(_))));
    }

    #[test]
    fn test_host_written_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let settings = InferenceSettings {
            seed: 42,
            use_chat_template: false,
            default_model: "tinyllama-1.1b-chat.Q4_K_M.gguf".to_string(),
            ..InferenceSettings::default()
        };
        fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();

        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }
}
