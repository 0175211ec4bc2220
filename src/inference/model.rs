//! GGUF model file checks
//!
//! Cheap header validation done before handing a path to llama.cpp, so a
//! wrong path fails with a clear message instead of a backend error.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Errors from model file validation
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (bad magic {0:?})")]
    BadMagic([u8; 4]),

    #[error("File too short to be a GGUF model")]
    Truncated,
}

/// Header fields read from a GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    pub size_bytes: u64,
}

/// Validate that `path` exists and carries a GGUF header
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }

    let mut file = File::open(path)?;
    let size_bytes = file.metadata()?.len();

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let mut header = [0u8; 24];
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })?;

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
        size_bytes,
    })
}
