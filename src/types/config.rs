//! Configuration types
//!
//! Server configuration loaded once from the environment at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::types::model::ModelParams;

/// Errors raised while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MODEL_PATH is not set")]
    MissingModelPath,

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Server configuration
///
/// Every key is optional except `MODEL_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Context window size
    pub n_ctx: u32,
    /// Number of GPU layers to offload (negative = all)
    pub n_gpu_layers: i32,
    /// Prompt batch size
    pub n_batch: u32,
    /// Generations admitted at the same time
    pub concurrency: usize,
    /// Requests allowed to wait for a generation slot
    pub max_queue: usize,
    /// Default sampling temperature
    pub temperature: f32,
    /// Default nucleus sampling parameter
    pub top_p: f32,
    /// Strip `<think>` regions from HTTP and UI output
    pub think_filter: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            host: "0.0.0.0".to_string(),
            port: 7860,
            n_ctx: 4096,
            n_gpu_layers: -1,
            n_batch: 512,
            concurrency: 2,
            max_queue: 32,
            temperature: 0.8,
            top_p: 0.9,
            think_filter: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {:?}", path);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let model_path = lookup("MODEL_PATH")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingModelPath)?;

        let mut config = Self {
            model_path: PathBuf::from(model_path),
            host: lookup("HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            n_ctx: parse_or(&lookup, "N_CTX", defaults.n_ctx)?,
            n_gpu_layers: parse_or(&lookup, "N_GPU_LAYERS", defaults.n_gpu_layers)?,
            n_batch: parse_or(&lookup, "N_BATCH", defaults.n_batch)?,
            concurrency: parse_or(&lookup, "CONCURRENCY", defaults.concurrency)?,
            max_queue: parse_or(&lookup, "MAX_QUEUE", defaults.max_queue)?,
            temperature: parse_finite_or(&lookup, "TEMPERATURE", defaults.temperature)?,
            top_p: parse_finite_or(&lookup, "TOP_P", defaults.top_p)?,
            think_filter: parse_or(&lookup, "THINK_FILTER", defaults.think_filter)?,
        };

        config.validate();
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Ensures sampling defaults and limits are within acceptable ranges.
    pub fn validate(&mut self) {
        if !self.temperature.is_finite() {
            tracing::warn!("TEMPERATURE {} is not finite, using 0.8", self.temperature);
            self.temperature = 0.8;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if !(self.top_p > 0.0) {
            tracing::warn!("TOP_P {} is not positive, using 1.0", self.top_p);
            self.top_p = 1.0;
        }
        self.top_p = self.top_p.min(1.0);

        if self.concurrency == 0 {
            self.concurrency = 1;
        }
        if self.n_batch == 0 {
            self.n_batch = 512;
        }
    }

    /// Parameters for loading the model handle
    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            path: self.model_path.clone(),
            n_ctx: self.n_ctx,
            n_gpu_layers: self.n_gpu_layers,
            n_batch: self.n_batch,
            n_threads: None,
        }
    }

    /// Socket address string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Like `parse_or`, but `NaN` and infinities are invalid
fn parse_finite_or<F>(lookup: &F, key: &'static str, default: f32) -> Result<f32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key,
            value: lookup(key).unwrap_or_default(),
        })
    }
}
