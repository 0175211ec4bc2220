//! Completion API
//!
//! `GET /healthz` and `POST /v1/completions`.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::inference::{CompletionStream, ERROR_MARKER};
use crate::server::admission::AdmissionError;
use crate::server::{AppState, Visibility};

/// Health check response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    pub model_path: PathBuf,
    pub n_ctx: u32,
}

fn default_max_tokens() -> u32 {
    256
}

fn default_stream() -> bool {
    true
}

/// Body of `POST /v1/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionBody {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

/// Non-streaming completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionText {
    pub text: String,
}

/// Errors returned to API clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Admission(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Sampling parameters after applying defaults
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sampling {
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

impl CompletionBody {
    fn sampling(&self, default_temperature: f32, default_top_p: f32) -> Result<Sampling, ApiError> {
        let temperature = self.temperature.unwrap_or(default_temperature);
        let top_p = self.top_p.unwrap_or(default_top_p);

        if self.max_tokens == 0 {
            return Err(ApiError::InvalidRequest("max_tokens must be at least 1".into()));
        }
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(ApiError::InvalidRequest(
                "temperature must be a non-negative number".into(),
            ));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(ApiError::InvalidRequest("top_p must be in (0, 1]".into()));
        }

        Ok(Sampling {
            max_tokens: self.max_tokens,
            temperature,
            top_p,
        })
    }
}

pub async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        ok: true,
        model_path: state.config.model_path.clone(),
        n_ctx: state.config.n_ctx,
    })
}

pub async fn completions(
    State(state): State<AppState>,
    Json(body): Json<CompletionBody>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("completion", %request_id);
    handle_completion(state, body).instrument(span).await
}

async fn handle_completion(state: AppState, body: CompletionBody) -> Result<Response, ApiError> {
    let sampling = body.sampling(state.config.temperature, state.config.top_p)?;
    tracing::info!(
        stream = body.stream,
        max_tokens = sampling.max_tokens,
        temperature = sampling.temperature,
        top_p = sampling.top_p,
        "Completion request"
    );

    let permit = state.gate.admit().await?;

    if body.stream {
        let mut visibility = Visibility::new(state.config.think_filter);
        let fragments = state
            .completer
            .infer_stream_async(
                &body.prompt,
                sampling.max_tokens,
                sampling.temperature,
                sampling.top_p,
            )
            .filter_map(move |fragment| futures::future::ready(visibility.pass(fragment)))
            .map(move |fragment| {
                // Slot stays taken until the body is fully sent
                let _held = &permit;
                Ok::<_, Infallible>(fragment)
            });

        return Ok((
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(fragments),
        )
            .into_response());
    }

    let completer = state.completer.clone();
    let think_filter = state.config.think_filter;
    let prompt = body.prompt;
    let fragments = tokio::task::spawn_blocking(move || {
        let mut visibility = Visibility::new(think_filter);
        completer
            .infer_stream(&prompt, sampling.max_tokens, sampling.temperature, sampling.top_p)
            .filter_map(|fragment| visibility.pass(fragment))
            .collect::<Vec<String>>()
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    drop(permit);

    // A failed generation always ends on its error fragment
    if let Some(failure) = fragments
        .last()
        .filter(|fragment| CompletionStream::is_error_fragment(fragment))
    {
        tracing::warn!("Generation failed: {}", failure);
        return Err(ApiError::Internal(
            failure.trim_start_matches(ERROR_MARKER).to_string(),
        ));
    }

    Ok(Json(CompletionText {
        text: fragments.concat(),
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::completion::testing::{completer, FakeGenerator, Script};
    use crate::inference::Prompt;
    use crate::server::{router, AppState};
    use crate::types::config::ServerConfig;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state_with(generator: Arc<FakeGenerator>, think_filter: bool) -> AppState {
        let config = ServerConfig {
            model_path: PathBuf::from("/models/persona.gguf"),
            n_ctx: 8192,
            think_filter,
            ..ServerConfig::default()
        };
        AppState::new(config, completer(generator))
    }

    async fn post_json(state: AppState, body: serde_json::Value) -> (StatusCode, String, Option<String>) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/completions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap(), content_type)
    }

    #[tokio::test]
    async fn test_healthz_echoes_config() {
        let state = state_with(FakeGenerator::fragments(&[]), true);
        let response = router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let health: Health = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            health,
            Health {
                ok: true,
                model_path: PathBuf::from("/models/persona.gguf"),
                n_ctx: 8192,
            }
        );
    }

    #[tokio::test]
    async fn test_streaming_body_is_raw_fragments() {
        let generator = FakeGenerator::fragments(&["Hello", ", ", "world"]);
        let (status, body, content_type) =
            post_json(state_with(generator.clone(), true), serde_json::json!({"prompt": "Say hi"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/event-stream"));
        assert_eq!(body, "Hello, world");

        // Defaults applied from config
        let requests = generator.recorded();
        assert_eq!(requests[0].max_tokens, 256);
        assert!((requests[0].temperature - 0.8).abs() < 0.001);
        assert!((requests[0].top_p - 0.9).abs() < 0.001);
        assert_eq!(requests[0].prompt, Prompt::Text("Say hi".to_string()));
    }

    #[tokio::test]
    async fn test_streaming_filters_thinking() {
        let generator = FakeGenerator::fragments(&["<think>", "plan", "</think>", "Answer"]);
        let (_, body, _) =
            post_json(state_with(generator, true), serde_json::json!({"prompt": "q"})).await;
        assert_eq!(body, "Answer");
    }

    #[tokio::test]
    async fn test_filter_disabled_returns_everything() {
        let generator = FakeGenerator::fragments(&["<think>", "plan", "</think>", "Answer"]);
        let (_, body, _) = post_json(
            state_with(generator, false),
            serde_json::json!({"prompt": "q", "stream": false}),
        )
        .await;
        let parsed: CompletionText = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.text, "<think>plan</think>Answer");
    }

    #[tokio::test]
    async fn test_buffered_response_is_json_text() {
        let generator = FakeGenerator::fragments(&["a", "b", "c"]);
        let (status, body, _) = post_json(
            state_with(generator.clone(), true),
            serde_json::json!({"prompt": "p", "stream": false, "max_tokens": 5, "temperature": 0.0, "top_p": 0.5}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let parsed: CompletionText = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.text, "abc");

        let requests = generator.recorded();
        assert_eq!(requests[0].max_tokens, 5);
        assert_eq!(requests[0].temperature, 0.0);
        assert!((requests[0].top_p - 0.5).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_generation_error_lands_in_body() {
        let generator = FakeGenerator::with_script(Script::FailMidStream(
            vec!["part".to_string()],
            "decode failed".to_string(),
        ));
        let (status, body, _) =
            post_json(state_with(generator, true), serde_json::json!({"prompt": "p"})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("part[error] "));
        assert!(body.contains("decode failed"));
    }

    #[tokio::test]
    async fn test_buffered_failure_is_server_error() {
        let generator = FakeGenerator::with_script(Script::RefuseToStart("worker gone".to_string()));
        let (status, body, content_type) = post_json(
            state_with(generator, true),
            serde_json::json!({"prompt": "p", "stream": false}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let message = parsed["error"].as_str().unwrap();
        assert!(message.contains("worker gone"));
        assert!(!message.contains("[error]"));
    }

    #[tokio::test]
    async fn test_buffered_mid_stream_failure_drops_partial_text() {
        for think_filter in [true, false] {
            let generator = FakeGenerator::with_script(Script::FailMidStream(
                vec!["<think>".to_string(), "part".to_string()],
                "decode failed".to_string(),
            ));
            let (status, body, _) = post_json(
                state_with(generator, think_filter),
                serde_json::json!({"prompt": "p", "stream": false}),
            )
            .await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert!(parsed["error"].as_str().unwrap().contains("decode failed"));
            assert!(parsed.get("text").is_none());
        }
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let generator = FakeGenerator::fragments(&["x"]);
        let (status, body, _) = post_json(
            state_with(generator.clone(), true),
            serde_json::json!({"prompt": "p", "top_p": 0.0}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("top_p"));

        let (status, _, _) = post_json(
            state_with(generator.clone(), true),
            serde_json::json!({"prompt": "p", "max_tokens": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(generator.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_busy_server_returns_503() {
        let generator = FakeGenerator::fragments(&["x"]);
        let mut state = state_with(generator, true);
        state.gate = crate::server::admission::AdmissionGate::new(1, 0);
        let _taken = state.gate.admit().await.unwrap();

        let (status, body, _) = post_json(state, serde_json::json!({"prompt": "p"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("queue is full"));
    }

    #[test]
    fn test_body_defaults() {
        let body: CompletionBody = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(body.max_tokens, 256);
        assert!(body.stream);
        assert!(body.temperature.is_none());
        assert!(body.top_p.is_none());
    }
}
