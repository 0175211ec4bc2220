//! Persona dataset generation
//!
//! Produces instruction/output pairs either by asking a hosted chat model a
//! set of seed questions or by sampling a public Hugging Face dataset. Both
//! modes end by writing one pretty-printed JSON array.

pub mod corpus;
pub mod remote;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use corpus::{generate_from_corpus, CorpusSource, HuggingFaceRows, DEFAULT_CORPUS};
pub use remote::{generate_from_chat, ChatApi, OpenAiChat, SEED_QUESTIONS, SYSTEM_PROMPT};

/// Default output file
pub const DEFAULT_OUTPUT: &str = "data/persona_dataset.json";

/// Errors that can occur while generating a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset {0} has no rows")]
    EmptyDataset(String),
}

/// One instruction-tuning example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

impl DatasetRecord {
    /// Record with the always-empty `input` field
    pub fn new(instruction: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: String::new(),
            output: output.into(),
        }
    }
}

/// Write records as an indented JSON array, creating parent directories
pub fn write_dataset<P: AsRef<Path>>(path: P, records: &[DatasetRecord]) -> Result<(), DatasetError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(records)?;
    fs::write(path, json)?;

    tracing::info!("Saved {} records to {:?}", records.len(), path);
    Ok(())
}

/// Read a dataset file back
pub fn read_dataset<P: AsRef<Path>>(path: P) -> Result<Vec<DatasetRecord>, DatasetError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_parent_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("out.json");
        let records = vec![
            DatasetRecord::new("自由意志是否存在？", "也许。"),
            DatasetRecord::new("What is 2+2?", "4"),
        ];

        write_dataset(&path, &records).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        // Non-ASCII is written as-is, not escaped
        assert!(raw.contains("自由意志是否存在？"));
        assert!(raw.contains("\n  {"));

        let loaded = read_dataset(&path).unwrap();
        assert_eq!(loaded, records);
        let reserialized = serde_json::to_string_pretty(&loaded).unwrap();
        assert_eq!(reserialized, raw);
    }

    #[test]
    fn test_record_has_all_keys() {
        let value = serde_json::to_value(DatasetRecord::new("q", "a")).unwrap();
        assert_eq!(value["instruction"], "q");
        assert_eq!(value["input"], "");
        assert_eq!(value["output"], "a");
    }

    #[test]
    fn test_empty_dataset_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        write_dataset(&path, &[]).unwrap();
        assert!(read_dataset(&path).unwrap().is_empty());
    }
}
