//! Token estimation for prompt budgeting.
//!
//! Uses a flat 4-characters-per-token ratio: cheap, deterministic and free of
//! tokenizer dependencies. Good enough to decide when to compress, not to
//! bill by.

use crate::session::Message;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message overhead (role markers, separators).
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Measures prompts against a token target.
///
/// # Example
///
/// ```
/// use speakmcp_core::agent::ContextMonitor;
/// use speakmcp_core::session::Message;
///
/// let monitor = ContextMonitor::new(1000, 0.65);
/// assert_eq!(monitor.target_tokens(), 650);
///
/// let messages = vec![Message::system("Be brief."), Message::user("Hi")];
/// assert!(!monitor.exceeds_target(&messages));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ContextMonitor {
    context_window: usize,
    target_ratio: f64,
}

impl ContextMonitor {
    pub fn new(context_window: usize, target_ratio: f64) -> Self {
        Self {
            context_window,
            target_ratio,
        }
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Token ceiling the prompt should stay under.
    pub fn target_tokens(&self) -> usize {
        (self.context_window as f64 * self.target_ratio).floor() as usize
    }

    pub fn exceeds_target(&self, messages: &[Message]) -> bool {
        Self::estimate_tokens(messages) > self.target_tokens()
    }

    /// Estimated share of the context window in use.
    pub fn usage_ratio(&self, messages: &[Message]) -> f64 {
        if self.context_window == 0 {
            return 1.0;
        }
        Self::estimate_tokens(messages) as f64 / self.context_window as f64
    }

    /// Tokens for a piece of text, rounded up.
    pub fn estimate_text_tokens(text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    /// Tokens for a whole prompt: content plus planned tool calls.
    pub fn estimate_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message_tokens).sum()
    }

    pub fn estimate_message_tokens(message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS + Self::estimate_text_tokens(&message.content);
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                tokens += Self::estimate_text_tokens(&call.name)
                    + Self::estimate_text_tokens(&call.arguments_json());
            }
        }
        tokens
    }
}
