//! HTTP server
//!
//! Hosts the completion API and the web UI on one axum router. Both front
//! ends share the model through a single admission gate.

pub mod admission;
pub mod api;
pub mod ui;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;

use crate::inference::{CompletionStream, Completer, ThinkFilter};
use crate::types::config::ServerConfig;
use admission::AdmissionGate;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub completer: Completer,
    pub gate: AdmissionGate,
}

impl AppState {
    pub fn new(config: ServerConfig, completer: Completer) -> Self {
        let gate = AdmissionGate::new(config.concurrency, config.max_queue);
        Self {
            config: Arc::new(config),
            completer,
            gate,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/completions", post(api::completions))
        .route("/", get(ui::index))
        .route("/ui/generate", get(ui::generate))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Decides which fragments reach an HTTP client
///
/// Applies think-tag filtering when enabled. Error reports always pass.
pub(crate) struct Visibility {
    filter: Option<ThinkFilter>,
}

impl Visibility {
    pub(crate) fn new(think_filter: bool) -> Self {
        Self {
            filter: think_filter.then(ThinkFilter::new),
        }
    }

    pub(crate) fn pass(&mut self, fragment: String) -> Option<String> {
        if CompletionStream::is_error_fragment(&fragment) {
            return Some(fragment);
        }
        match self.filter.as_mut() {
            None => Some(fragment),
            Some(filter) => filter.push(&fragment).map(str::to_string),
        }
    }
}
