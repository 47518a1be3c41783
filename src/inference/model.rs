//! GGUF pre-flight checks
//!
//! llama.cpp reports a bad model path as a bare null pointer. Reading the
//! header ourselves first turns the common mistakes (wrong file, truncated
//! download, old format) into readable errors.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
pub const GGUF_HEADER_LEN: usize = 24;

/// Oldest and newest GGUF versions llama.cpp still reads
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("Model file is truncated ({0} bytes)")]
    Truncated(usize),
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    /// Parses a header from the first bytes of a file.
    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        if bytes.len() < GGUF_HEADER_LEN {
            return Err(ModelError::Truncated(bytes.len()));
        }

        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };

        let magic = u32_at(0);
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        let version = u32_at(4);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64_at(8),
            metadata_kv_count: u64_at(16),
        })
    }
}

/// Reads and checks the GGUF header of the file at `path`.
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let file = File::open(path)?;

    let mut bytes = Vec::with_capacity(GGUF_HEADER_LEN);
    file.take(GGUF_HEADER_LEN as u64).read_to_end(&mut bytes)?;

    GgufHeader::parse(&bytes)
}

/// True when the path ends in `.gguf` (any case).
pub fn has_gguf_extension<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn header_bytes(magic: u32, version: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(GGUF_HEADER_LEN);
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&291u64.to_le_bytes());
        bytes.extend_from_slice(&24u64.to_le_bytes());
        bytes
    }

    pub(crate) fn write_fake_model(bytes: &[u8]) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_valid_header() {
        let file = write_fake_model(&header_bytes(GGUF_MAGIC, 3));
        let header = read_gguf_header(file.path()).unwrap();

        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 24);
    }

    #[test]
    fn test_trailing_data_is_ignored() {
        let mut bytes = header_bytes(GGUF_MAGIC, 2);
        bytes.extend_from_slice(&[0xAB; 64]);
        let file = write_fake_model(&bytes);

        assert_eq!(read_gguf_header(file.path()).unwrap().version, 2);
    }

    #[test]
    fn test_wrong_magic() {
        let file = write_fake_model(&header_bytes(0xDEADBEEF, 3));
        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_ggml_v1_rejected() {
        let file = write_fake_model(&header_bytes(GGUF_MAGIC, 1));
        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_download() {
        let file = write_fake_model(&GGUF_MAGIC.to_le_bytes());
        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(ModelError::Truncated(4))));
    }

    #[test]
    fn test_missing_file() {
        let result = read_gguf_header("/nonexistent/model.gguf");
        assert!(matches!(result, Err(ModelError::Io(_))));
    }

    #[test]
    fn test_extension_check() {
        assert!(has_gguf_extension("models/llama-2-7b-chat.Q5_K_M.gguf"));
        assert!(has_gguf_extension("MODEL.GGUF"));
        assert!(!has_gguf_extension("model.bin"));
        assert!(!has_gguf_extension("gguf"));
    }
}
