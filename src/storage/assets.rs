//! Bundled model assets
//!
//! Mobile apps ship the GGUF file inside the application package, but
//! llama.cpp needs a real path it can mmap. The first load copies the asset
//! out to the models directory; later loads reuse the copy.

use crate::storage::StorageError;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Prefix models live under inside the application package
pub const ASSET_MODELS_PREFIX: &str = "models";

/// Read access to packaged application assets
pub trait AssetSource: Send + Sync {
    /// Opens the asset at `path`, relative to the asset root
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Assets unpacked on the filesystem (an extracted APK or an iOS bundle)
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirectoryAssets {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.root.join(path))?;
        Ok(Box::new(file))
    }
}

/// Rejects anything that is not a plain file name
fn check_model_name(name: &str) -> Result<(), StorageError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(StorageError::InvalidModelName(name.to_string())),
    }
}

fn write_file(path: &Path, input: &mut dyn Read) -> io::Result<u64> {
    let mut out = File::create(path)?;
    let n = io::copy(input, &mut out)?;
    out.flush()?;
    out.sync_all()?;
    Ok(n)
}

/// Returns the on-disk path of `model_name`, copying it out of the assets
/// first if it is not in `models_dir` yet.
///
/// The copy goes to a `.part` file that is renamed into place once complete,
/// so an interrupted copy is never mistaken for a finished model.
pub fn copy_model_from_assets_if_needed(
    models_dir: &Path,
    assets: &dyn AssetSource,
    model_name: &str,
) -> Result<PathBuf, StorageError> {
    check_model_name(model_name)?;
    fs::create_dir_all(models_dir)?;

    let model_file = models_dir.join(model_name);
    if model_file.is_file() {
        tracing::debug!("Model already unpacked: {}", model_file.display());
        return Ok(model_file);
    }

    let asset_path = format!("{}/{}", ASSET_MODELS_PREFIX, model_name);
    let mut input = assets.open(&asset_path)?;

    let partial = models_dir.join(format!("{}.part", model_name));
    let bytes = match write_file(&partial, &mut input) {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }
    };
    fs::rename(&partial, &model_file)?;

    tracing::info!(
        "Copied asset {} to {} ({} bytes)",
        asset_path,
        model_file.display(),
        bytes
    );
    Ok(model_file)
}
