//! Persistent storage
//!
//! Locates the binding's data directory and handles the files kept there:
//! unpacked model weights and the settings file.

use std::path::PathBuf;
use thiserror::Error;

pub mod assets;
pub mod settings;

/// Overrides the platform data directory. Mobile hosts point this at their
/// sandboxed files directory before the first call into the library.
pub const DATA_DIR_ENV: &str = "LLAMA_INFERENCE_DATA_DIR";

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid model name: {0:?}")]
    InvalidModelName(String),
}

/// Get the binding's data directory
///
/// `LLAMA_INFERENCE_DATA_DIR` wins when set. Otherwise the platform default:
/// - macOS/iOS: `~/Library/Application Support/com.localchatbot.LlamaInference`
/// - Linux/Android: `$XDG_DATA_HOME/llamainference` (usually `~/.local/share`)
/// - Windows: `%APPDATA%\localchatbot\LlamaInference\data`
pub fn data_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    directories::ProjectDirs::from("com", "localchatbot", "LlamaInference")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Directory unpacked model files are kept in
pub fn models_dir() -> Result<PathBuf, StorageError> {
    Ok(data_dir()?.join("models"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_env_override() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var(DATA_DIR_ENV, dir.path());

        assert_eq!(data_dir().unwrap(), dir.path());
        assert_eq!(models_dir().unwrap(), dir.path().join("models"));

        // An empty override falls back to the platform directory
        std::env::set_var(DATA_DIR_ENV, "");
        if let Ok(platform) = data_dir() {
            assert_ne!(platform, PathBuf::new());
            assert_ne!(platform, dir.path());
        }

        std::env::remove_var(DATA_DIR_ENV);
    }

    #[test]
    fn test_storage_error_messages() {
        let err = StorageError::InvalidModelName("../etc/passwd".to_string());
        assert_eq!(err.to_string(), "Invalid model name: \"../etc/passwd\"");
    }
}
