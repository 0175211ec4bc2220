//! Web UI
//!
//! A single form page plus an SSE endpoint. Each event carries the full
//! visible text so far, and the page replaces its output with it.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;

use crate::server::{AppState, Visibility};

const INDEX_HTML: &str = include_str!("index.html");

/// Shown instead of calling the model when the prompt is blank
pub const EMPTY_PROMPT_MESSAGE: &str = "Please enter a prompt.";

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Query parameters sent by the form
#[derive(Debug, Clone, Deserialize)]
pub struct UiForm {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

impl UiForm {
    /// Slider values, clamped to the ranges the page offers
    fn sampling(&self, default_temperature: f32, default_top_p: f32) -> (u32, f32, f32) {
        let max_tokens = self
            .max_tokens
            .filter(|n| n.is_finite())
            .unwrap_or(256.0)
            .round()
            .clamp(1.0, 1024.0) as u32;
        let temperature = self
            .temperature
            .map(|t| t as f32)
            .filter(|t| t.is_finite())
            .unwrap_or(default_temperature)
            .clamp(0.0, 1.5);
        let top_p = self
            .top_p
            .map(|p| p as f32)
            .filter(|p| p.is_finite())
            .unwrap_or(default_top_p)
            .clamp(0.1, 1.0);
        (max_tokens, temperature, top_p)
    }
}

pub async fn index(State(state): State<AppState>) -> Html<String> {
    Html(
        INDEX_HTML
            .replace("{{TEMPERATURE}}", &state.config.temperature.to_string())
            .replace("{{TOP_P}}", &state.config.top_p.to_string()),
    )
}

fn text_event(text: &str) -> Result<Event, Infallible> {
    // JSON keeps newlines intact inside a single SSE data line
    let data = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    Ok(Event::default().data(data))
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().event("done").data(""))
}

fn single_message(message: &str) -> EventStream {
    stream::iter([text_event(message), done_event()]).boxed()
}

pub async fn generate(
    State(state): State<AppState>,
    Query(form): Query<UiForm>,
) -> Sse<EventStream> {
    let events = if form.prompt.trim().is_empty() {
        single_message(EMPTY_PROMPT_MESSAGE)
    } else {
        match state.gate.admit().await {
            Ok(permit) => {
                let (max_tokens, temperature, top_p) =
                    form.sampling(state.config.temperature, state.config.top_p);
                tracing::info!(max_tokens, temperature, top_p, "UI generation");

                let mut visibility = Visibility::new(state.config.think_filter);
                let mut shown = String::new();
                state
                    .completer
                    .infer_stream_async(&form.prompt, max_tokens, temperature, top_p)
                    .filter_map(move |fragment| {
                        let update = visibility.pass(fragment).map(|visible| {
                            shown.push_str(&visible);
                            text_event(&shown)
                        });
                        futures::future::ready(update)
                    })
                    .chain(stream::once(async move {
                        drop(permit);
                        done_event()
                    }))
                    .boxed()
            }
            Err(e) => single_message(&e.to_string()),
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}
