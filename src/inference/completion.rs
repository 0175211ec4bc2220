//! Completion adapter
//!
//! Uniform access to the model for every front end. Generation errors never
//! escape as `Err` from here: they are folded into the text channel as a
//! fragment starting with [`ERROR_MARKER`], so callers always have something
//! to render.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;

use crate::inference::engine::{GenerationRequest, Prompt, TextGenerator};
use crate::inference::streaming::StreamToken;

/// Prefix of the fragment reporting a failed generation
pub const ERROR_MARKER: &str = "[error] ";

/// Fragments buffered between the blocking reader and an async consumer
const ASYNC_BUFFER: usize = 64;

/// Shared completion entry point
#[derive(Clone)]
pub struct Completer {
    generator: Arc<dyn TextGenerator>,
}

impl Completer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Wrap a freshly loaded generator and kick off its warmup
    pub fn warmed(generator: Arc<dyn TextGenerator>) -> Self {
        let completer = Self::new(generator);
        spawn_warmup(completer.clone());
        completer
    }

    /// Raw-text completion, streamed
    pub fn infer_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    ) -> CompletionStream {
        self.stream_prompt(Prompt::Text(prompt.to_string()), max_tokens, temperature, top_p)
    }

    /// Raw-text completion, concatenated
    pub fn infer_once(&self, prompt: &str, max_tokens: u32, temperature: f32, top_p: f32) -> String {
        self.infer_stream(prompt, max_tokens, temperature, top_p)
            .collect()
    }

    /// Stream any prompt kind, including chat history
    pub fn stream_prompt(
        &self,
        prompt: Prompt,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    ) -> CompletionStream {
        let request = GenerationRequest {
            prompt,
            max_tokens,
            temperature,
            top_p,
            seed: 0,
        };
        match self.generator.generate(request) {
            Ok(rx) => CompletionStream::from_receiver(rx),
            Err(e) => {
                tracing::warn!("Generation could not start: {}", e);
                CompletionStream::failed(e.to_string())
            }
        }
    }

    /// Async view of [`Completer::infer_stream`] for the HTTP front ends
    ///
    /// A blocking task drains the engine channel and forwards fragments in
    /// order. Dropping the returned stream drops the engine receiver once the
    /// next fragment arrives.
    pub fn infer_stream_async(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    ) -> impl Stream<Item = String> + Send + 'static {
        let stream = self.infer_stream(prompt, max_tokens, temperature, top_p);
        let (tx, rx) = mpsc::channel::<String>(ASYNC_BUFFER);

        tokio::task::spawn_blocking(move || {
            for fragment in stream {
                if tx.blocking_send(fragment).is_err() {
                    tracing::debug!("Stream consumer went away");
                    break;
                }
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|fragment| (fragment, rx))
        })
    }
}

enum StreamSource {
    Engine(Receiver<StreamToken>),
    Failed(String),
    Finished,
}

/// Lazy, consume-once sequence of completion fragments
///
/// Yields engine fragments in emission order. A failure yields one final
/// fragment carrying [`ERROR_MARKER`], after which the sequence ends.
pub struct CompletionStream {
    source: StreamSource,
}

impl CompletionStream {
    pub fn from_receiver(rx: Receiver<StreamToken>) -> Self {
        Self {
            source: StreamSource::Engine(rx),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            source: StreamSource::Failed(reason.into()),
        }
    }

    /// True if `fragment` reports a generation failure
    pub fn is_error_fragment(fragment: &str) -> bool {
        fragment.starts_with(ERROR_MARKER)
    }
}

fn error_fragment(reason: &str) -> String {
    format!("{ERROR_MARKER}{reason}")
}

impl Iterator for CompletionStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.source, StreamSource::Finished) {
            StreamSource::Finished => None,
            StreamSource::Failed(reason) => Some(error_fragment(&reason)),
            StreamSource::Engine(rx) => match rx.recv() {
                Ok(StreamToken::Token(text)) => {
                    self.source = StreamSource::Engine(rx);
                    Some(text)
                }
                Ok(StreamToken::Done) => None,
                Ok(StreamToken::Error(e)) => Some(error_fragment(&e)),
                Err(_) => Some(error_fragment("inference worker stopped unexpectedly")),
            },
        }
    }
}

/// Fire-and-forget warmup call on a background thread
///
/// Processes a minimal prompt without generating, so lazy initialization in
/// the engine happens before the first real request. Never awaited.
pub fn spawn_warmup(completer: Completer) {
    let spawned = std::thread::Builder::new()
        .name("warmup".to_string())
        .spawn(move || {
            let result = completer.infer_once("Hello", 0, 0.0, 1.0);
            if CompletionStream::is_error_fragment(&result) {
                tracing::warn!("[warmup] {}", result);
            } else {
                tracing::debug!("[warmup] done");
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("[warmup] could not start thread: {}", e);
    }
}
