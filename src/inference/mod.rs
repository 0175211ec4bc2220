//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp for model loading and inference.

pub mod completion;
pub mod engine;
pub mod model;
pub mod streaming;
pub mod think;

// Re-export main types for convenience
pub use completion::{spawn_warmup, CompletionStream, Completer, ERROR_MARKER};
pub use engine::{EngineError, GenerationRequest, LlamaEngine, LoadedModelInfo, Prompt, TextGenerator};
pub use model::{validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
pub use streaming::StreamToken;
pub use think::{ThinkFilter, ThinkState};
