//! Streaming token types
//!
//! Messages sent from the inference worker thread to consumers.

/// A single message on a generation channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// A decoded text fragment
    Token(String),
    /// Generation finished normally
    Done,
    /// Generation failed; no more tokens follow
    Error(String),
}
