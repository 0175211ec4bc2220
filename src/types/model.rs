//! Model types
//!
//! Defines the parameters a model handle is constructed from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parameters used to load a GGUF model once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Path to the GGUF file
    pub path: PathBuf,
    /// Context window size
    pub n_ctx: u32,
    /// Number of layers to offload to GPU (negative = all layers)
    pub n_gpu_layers: i32,
    /// Prompt batch size
    pub n_batch: u32,
    /// Worker threads used by llama.cpp (None = library default)
    pub n_threads: Option<u32>,
}

impl ModelParams {
    /// GPU layer count as expected by llama.cpp, where "all layers" is `u32::MAX`
    pub fn gpu_layers(&self) -> u32 {
        u32::try_from(self.n_gpu_layers).unwrap_or(u32::MAX)
    }
}
