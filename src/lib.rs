//! EchoPersona Library
//!
//! Front ends and tooling around a local GGUF model: a terminal chat, an
//! HTTP completion API with a web UI, and a persona dataset generator.

pub mod chat;
pub mod dataset;
pub mod inference;
pub mod server;
pub mod types;
