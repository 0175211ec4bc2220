//! Remote chat-API mode
//!
//! Asks a hosted chat model each sampled seed question under a fixed persona
//! prompt and records the replies.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetError, DatasetRecord};

/// Persona given to the remote model as its system prompt
pub const SYSTEM_PROMPT: &str = "你是一个讽刺幽默但有深度的 AI，对问题从不直接回答，而是引导人反思。用语要冷静、克制，有存在主义气质。";

/// Questions the dataset is seeded from
pub const SEED_QUESTIONS: [&str; 5] = [
    "自由意志是否存在？",
    "人类为什么害怕孤独？",
    "科技会毁灭还是拯救文明？",
    "快乐和意义哪个更重要？",
    "什么是一个人真正的自我？",
];

/// Each seed question may appear at most this many times
const SEED_REPEATS: usize = 3;

/// Default remote model
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// A hosted chat-completion service
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, DatasetError>;
}

// ============================================================================
// OpenAI-compatible API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Client for `POST {base}/chat/completions`
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, DatasetError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`
    pub fn from_env(model: impl Into<String>) -> Result<Self, DatasetError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| DatasetError::MissingEnv("OPENAI_API_KEY"))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, api_key, model)
    }
}

#[async_trait]
impl ChatApi for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String, DatasetError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DatasetError::Api {
                status: status.as_u16(),
                body,
            });
        }

        parse_chat_response(&body)
    }
}

fn parse_chat_response(body: &str) -> Result<String, DatasetError> {
    let parsed: ChatResponse = serde_json::from_str(body)?;

    if let Some(error) = parsed.error {
        return Err(DatasetError::Response(error.message));
    }

    parsed
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| DatasetError::Response("No response content from model".into()))
}

/// Pick `n` questions from the seed list repeated [`SEED_REPEATS`] times
///
/// Sampling is without replacement from the repeated pool, so `n` is capped
/// at `SEED_QUESTIONS.len() * SEED_REPEATS`.
pub fn sample_questions<R: rand::Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<&'static str> {
    let pool: Vec<&'static str> = SEED_QUESTIONS
        .iter()
        .copied()
        .cycle()
        .take(SEED_QUESTIONS.len() * SEED_REPEATS)
        .collect();

    if n > pool.len() {
        tracing::warn!("Requested {} questions, only {} available", n, pool.len());
    }

    pool.choose_multiple(rng, n.min(pool.len()))
        .copied()
        .collect()
}

/// Generate records by asking `api` each sampled question
pub async fn generate_from_chat(api: &dyn ChatApi, n: usize) -> Result<Vec<DatasetRecord>, DatasetError> {
    let questions = sample_questions(n, &mut rand::thread_rng());
    let mut dataset = Vec::with_capacity(questions.len());

    for question in questions {
        tracing::info!("Generating: {}", question);
        let answer = api.complete(SYSTEM_PROMPT, question).await?;
        dataset.push(DatasetRecord::new(question, answer));
    }

    Ok(dataset)
}
