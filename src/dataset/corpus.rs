//! Public corpus mode
//!
//! Samples a contiguous window of rows from a Hugging Face dataset through
//! the datasets-server REST API and keeps the rows that have both a
//! `question` and a `response` field.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::dataset::{DatasetError, DatasetRecord};

/// Dataset sampled when none is given
pub const DEFAULT_CORPUS: &str = "Open-Orca/OpenOrca";

const DATASETS_SERVER: &str = "https://datasets-server.huggingface.co";

/// Largest page the rows endpoint serves
const PAGE_SIZE: u64 = 100;

/// A source of raw dataset rows
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;
    async fn row_count(&self) -> Result<u64, DatasetError>;
    async fn rows(&self, offset: u64, length: u64) -> Result<Vec<Value>, DatasetError>;
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<RowEntry>,
    num_rows_total: u64,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: Value,
}

/// Hugging Face datasets-server client for one dataset split
pub struct HuggingFaceRows {
    client: reqwest::Client,
    dataset: String,
    config: String,
    split: String,
}

impl HuggingFaceRows {
    pub fn new(dataset: impl Into<String>) -> Result<Self, DatasetError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            dataset: dataset.into(),
            config: "default".to_string(),
            split: "train".to_string(),
        })
    }

    /// Read a different config/split than `default`/`train`
    pub fn with_split(mut self, config: impl Into<String>, split: impl Into<String>) -> Self {
        self.config = config.into();
        self.split = split.into();
        self
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<RowsResponse, DatasetError> {
        let response = self
            .client
            .get(format!("{}/rows", DATASETS_SERVER))
            .query(&[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", self.split.as_str()),
            ])
            .query(&[("offset", offset), ("length", length)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DatasetError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CorpusSource for HuggingFaceRows {
    fn name(&self) -> &str {
        &self.dataset
    }

    async fn row_count(&self) -> Result<u64, DatasetError> {
        Ok(self.fetch(0, 1).await?.num_rows_total)
    }

    async fn rows(&self, offset: u64, length: u64) -> Result<Vec<Value>, DatasetError> {
        let page = self.fetch(offset, length).await?;
        Ok(page.rows.into_iter().map(|entry| entry.row).collect())
    }
}

/// Map a raw row onto a record, if it has the needed fields
pub fn record_from_row(row: &Value) -> Option<DatasetRecord> {
    let instruction = row.get("question")?.as_str()?;
    let output = row.get("response")?.as_str()?;
    Some(DatasetRecord::new(instruction, output))
}

/// Sample `n` consecutive rows from a random offset and convert them
pub async fn generate_from_corpus(
    source: &dyn CorpusSource,
    n: usize,
) -> Result<Vec<DatasetRecord>, DatasetError> {
    tracing::info!("Downloading and processing from {}...", source.name());

    let total = source.row_count().await?;
    if total == 0 {
        return Err(DatasetError::EmptyDataset(source.name().to_string()));
    }

    let window = (n as u64).min(total);
    let start = rand::thread_rng().gen_range(0..=total - window);
    tracing::debug!("Sampling rows {}..{} of {}", start, start + window, total);

    let mut records = Vec::with_capacity(window as usize);
    let mut skipped = 0usize;
    let mut offset = start;
    let end = start + window;
    while offset < end {
        let length = (end - offset).min(PAGE_SIZE);
        let rows = source.rows(offset, length).await?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as u64;

        for row in &rows {
            match record_from_row(row) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        tracing::debug!("Skipped {} rows without question/response", skipped);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct MemoryCorpus {
        rows: Vec<Value>,
        requests: Mutex<Vec<(u64, u64)>>,
    }

    impl MemoryCorpus {
        fn new(rows: Vec<Value>) -> Self {
            Self {
                rows,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CorpusSource for MemoryCorpus {
        fn name(&self) -> &str {
            "memory"
        }

        async fn row_count(&self) -> Result<u64, DatasetError> {
            Ok(self.rows.len() as u64)
        }

        async fn rows(&self, offset: u64, length: u64) -> Result<Vec<Value>, DatasetError> {
            self.requests.lock().unwrap().push((offset, length));
            Ok(self
                .rows
                .iter()
                .skip(offset as usize)
                .take(length as usize)
                .cloned()
                .collect())
        }
    }

    fn qa(i: usize) -> Value {
        json!({"id": i, "system_prompt": "", "question": format!("q{i}"), "response": format!("a{i}")})
    }

    #[test]
    fn test_record_from_row() {
        let record = record_from_row(&qa(1)).unwrap();
        assert_eq!(record, DatasetRecord::new("q1", "a1"));

        assert!(record_from_row(&json!({"question": "only q"})).is_none());
        assert!(record_from_row(&json!({"response": "only a"})).is_none());
        assert!(record_from_row(&json!({"question": 3, "response": "a"})).is_none());
    }

    #[tokio::test]
    async fn test_rows_missing_fields_are_skipped() {
        let corpus = MemoryCorpus::new(vec![
            qa(0),
            json!({"prompt": "p", "completion": "c"}),
            qa(2),
        ]);
        let records = generate_from_corpus(&corpus, 3).await.unwrap();
        assert_eq!(records.len(), 2);
        for record in records {
            assert!(record.instruction.starts_with('q'));
            assert!(record.output.starts_with('a'));
            assert_eq!(record.input, "");
        }
    }

    #[tokio::test]
    async fn test_window_is_contiguous_and_paged() {
        let corpus = MemoryCorpus::new((0..1000).map(qa).collect());
        let records = generate_from_corpus(&corpus, 250).await.unwrap();
        assert_eq!(records.len(), 250);

        let first: usize = records[0].instruction[1..].parse().unwrap();
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.instruction, format!("q{}", first + i));
        }

        let requests = corpus.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|&(_, len)| len <= PAGE_SIZE));
    }

    #[tokio::test]
    async fn test_small_dataset_is_taken_whole() {
        let corpus = MemoryCorpus::new((0..5).map(qa).collect());
        let records = generate_from_corpus(&corpus, 20).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].instruction, "q0");
    }

    #[tokio::test]
    async fn test_empty_dataset_errors() {
        let corpus = MemoryCorpus::new(Vec::new());
        let err = generate_from_corpus(&corpus, 5).await.unwrap_err();
        assert!(matches!(err, DatasetError::EmptyDataset(_)));
    }

    #[test]
    fn test_split_selection() {
        let rows = HuggingFaceRows::new("Open-Orca/OpenOrca").unwrap();
        assert_eq!((rows.config.as_str(), rows.split.as_str()), ("default", "train"));

        let rows = rows.with_split("2024", "validation");
        assert_eq!(rows.name(), "Open-Orca/OpenOrca");
        assert_eq!((rows.config.as_str(), rows.split.as_str()), ("2024", "validation"));
    }

    #[test]
    fn test_rows_response_parsing() {
        let body = json!({
            "features": [],
            "rows": [{"row_idx": 0, "row": {"question": "q", "response": "a"}, "truncated_cells": []}],
            "num_rows_total": 4233923,
            "num_rows_per_page": 100,
            "partial": false
        });
        let parsed: RowsResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.num_rows_total, 4233923);
        assert_eq!(record_from_row(&parsed.rows[0].row), Some(DatasetRecord::new("q", "a")));
    }
}
