//! Terminal chat loop
//!
//! Line-based REPL over a chat conversation. Replies stream to the terminal
//! as they are generated, with `<think>` regions hidden from both the screen
//! and the stored history.

use std::io::{self, BufRead, Write};

use crate::inference::{CompletionStream, Completer, Prompt, ThinkFilter};
use crate::types::message::Conversation;

/// Default system prompt for the REPL
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are TARS./no_think";

/// Words that end the session (case-insensitive)
const EXIT_WORDS: [&str; 3] = ["exit", "quit", "bye"];

/// Sampling settings used for every turn
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_tokens: 384,
            temperature: 0.8,
            top_p: 0.95,
        }
    }
}

fn is_exit_command(line: &str) -> bool {
    EXIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w))
}

/// Run the chat loop until an exit word or end of input
///
/// The conversation is left holding the full session history.
pub fn run_repl<R, W>(
    completer: &Completer,
    conversation: &mut Conversation,
    settings: &ChatSettings,
    mut input: R,
    mut output: W,
) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    loop {
        write!(output, "You:")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }

        let user_in = line.trim();
        if is_exit_command(user_in) {
            break;
        }
        conversation.push_user(user_in);

        let stream = completer.stream_prompt(
            Prompt::Chat(conversation.messages().to_vec()),
            settings.max_tokens,
            settings.temperature,
            settings.top_p,
        );

        let mut filter = ThinkFilter::new();
        for fragment in stream {
            if fragment.is_empty() {
                continue;
            }
            // Failures are shown even inside a reasoning region, never stored
            let visible = if CompletionStream::is_error_fragment(&fragment) {
                Some(fragment.as_str())
            } else {
                filter.push(&fragment)
            };
            if let Some(visible) = visible {
                write!(output, "{visible}")?;
                output.flush()?;
            }
        }
        writeln!(output)?;

        conversation.push_assistant(filter.into_visible());
        tracing::debug!("Conversation has {} messages", conversation.len());
    }

    Ok(())
}
