//! Context compaction primitives.
//!
//! Pure functions over `Vec<Message>` used by the budget manager's tiers:
//!
//! - **System prompt compaction**: drop schema boilerplate and repeated
//!   paragraphs, then cap the length.
//! - **Tool result digest**: a deterministic, field-preserving summary of an
//!   oversized tool result.
//! - **Middle summary**: replace everything between the system message and
//!   the last K exchanges with one summary message.
//! - **Critical filter**: keep the system message, messages matching a
//!   keyword heuristic and the last N exchanges.
//!
//! The caller obtains any LLM-generated summaries before calling these.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::session::{Message, Role};
use crate::utils::string::{preview, truncate_with_marker};

/// Line prefix marking tool schema detail in the system prompt.
pub const SCHEMA_LINE_PREFIX: &str = "  Schema:";

/// Prefix of synthetic summary messages.
pub const SUMMARY_PREFIX: &str = "[Conversation Summary]";

/// Messages worth keeping when everything else has to go.
static CRITICAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(error|errors|failed|failure|exception|created|session|token|key|id|url|path|password|credential|success(ful)?)\b",
    )
    .expect("valid critical keyword regex")
});

/// Strip schema lines and repeated paragraphs from a system prompt, then cap
/// it at `max_chars`.
///
/// # Examples
/// ```
/// use speakmcp_core::agent::compaction::compact_system_prompt;
///
/// let prompt = "Intro\n\n- files:read(path*)\n  Schema: {\"type\":\"object\"}\n\nIntro";
/// let compacted = compact_system_prompt(prompt, 1000);
/// assert!(!compacted.contains("Schema"));
/// assert_eq!(compacted.matches("Intro").count(), 1);
/// ```
pub fn compact_system_prompt(content: &str, max_chars: usize) -> String {
    let mut seen = HashSet::new();
    let mut paragraphs = Vec::new();
    for paragraph in content.split("\n\n") {
        let kept: Vec<&str> = paragraph
            .lines()
            .filter(|line| !line.starts_with(SCHEMA_LINE_PREFIX))
            .collect();
        let paragraph = kept.join("\n");
        let key = paragraph.trim().to_string();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        paragraphs.push(paragraph);
    }
    truncate_with_marker(&paragraphs.join("\n\n"), max_chars)
}

/// Deterministic digest of a tool result, at most about `max_chars` long.
///
/// JSON results keep their top-level scalar fields and describe nested
/// values by shape. Text results keep their head and tail lines. If the
/// digest is still too long it is hard-truncated.
pub fn digest_tool_result(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }

    let (label, body) = split_result_label(content);
    let digest = match serde_json::from_str::<Value>(body.trim()) {
        Ok(value) => digest_json(&value),
        Err(_) => digest_text(body, max_chars),
    };
    let digest = format!("{}[digest of {} chars]\n{}", label, total, digest);
    truncate_with_marker(&digest, max_chars)
}

/// Rendered tool results start with a `[provider:tool]` line; keep it.
fn split_result_label(content: &str) -> (&str, &str) {
    if content.starts_with('[') {
        if let Some(end) = content.find('\n') {
            let (label, rest) = content.split_at(end + 1);
            if label.trim_end().ends_with(']') {
                return (label, rest);
            }
        }
    }
    ("", content)
}

fn digest_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut lines = Vec::with_capacity(map.len());
            for (key, v) in map {
                lines.push(format!("{}: {}", key, describe_value(v)));
            }
            lines.join("\n")
        }
        Value::Array(items) => {
            let mut out = format!("array of {} items", items.len());
            if let Some(first) = items.first() {
                out.push_str(&format!("; first: {}", describe_value(first)));
            }
            out
        }
        other => describe_value(other),
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", preview(s, 120)),
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
            let more = if map.len() > keys.len() { ", ..." } else { "" };
            format!("{{{}{}}}", keys.join(", "), more)
        }
        other => other.to_string(),
    }
}

fn digest_text(body: &str, max_chars: usize) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let keep = (max_chars / 160).clamp(2, 20);
    if lines.len() <= keep * 2 {
        return preview(body, max_chars);
    }
    let head = lines[..keep].join("\n");
    let tail = lines[lines.len() - keep..].join("\n");
    format!(
        "{}\n... [{} lines omitted] ...\n{}",
        head,
        lines.len() - keep * 2,
        tail
    )
}

/// Whether `messages[i]` opens a new exchange.
///
/// A user message always does. An assistant message does unless it answers
/// the user message right before it, so tool-calling turns inside one run
/// count as exchanges of their own. Tool results belong to the turn above.
fn starts_exchange(messages: &[Message], i: usize) -> bool {
    match messages[i].role {
        Role::User => true,
        Role::Assistant => i == 0 || messages[i - 1].role != Role::User,
        _ => false,
    }
}

/// Index where the last `exchanges` exchanges begin.
///
/// Returns the index of the first non-system message when there are fewer
/// exchanges than requested.
pub fn recent_exchange_start(messages: &[Message], exchanges: usize) -> usize {
    let first_non_system = messages
        .iter()
        .position(|m| m.role != Role::System)
        .unwrap_or(messages.len());
    if exchanges == 0 {
        return messages.len();
    }
    let mut seen = 0;
    for i in (first_non_system..messages.len()).rev() {
        if starts_exchange(messages, i) {
            seen += 1;
            if seen == exchanges {
                return i;
            }
        }
    }
    first_non_system
}

/// Replace the middle of the conversation with one summary message.
///
/// Keeps the leading system message(s) and the last `keep_exchanges`
/// exchanges verbatim. Returns the input unchanged when there is no middle.
///
/// # Examples
/// ```
/// use speakmcp_core::session::Message;
/// use speakmcp_core::agent::compaction::summarize_middle;
///
/// let msgs = vec![
///     Message::system("You are helpful."),
///     Message::user("Tell me about Rust"),
///     Message::assistant("Rust is a systems language..."),
///     Message::user("What about async?"),
///     Message::assistant("Async in Rust uses tokio..."),
/// ];
/// let result = summarize_middle(msgs, 1, "User asked about Rust.");
/// assert_eq!(result.len(), 4); // system + summary + last exchange
/// ```
pub fn summarize_middle(
    messages: Vec<Message>,
    keep_exchanges: usize,
    summary_text: &str,
) -> Vec<Message> {
    let (head_end, tail_start) = middle_bounds(&messages, keep_exchanges.max(1));
    if tail_start <= head_end {
        return messages;
    }
    let summary = Message::assistant(&format!("{}\n{}", SUMMARY_PREFIX, summary_text));
    let mut result = Vec::with_capacity(head_end + 1 + messages.len() - tail_start);
    let mut iter = messages.into_iter();
    result.extend(iter.by_ref().take(head_end));
    result.push(summary);
    result.extend(iter.skip(tail_start - head_end));
    result
}

/// `(end of leading system block, start of kept tail)`.
fn middle_bounds(messages: &[Message], keep_exchanges: usize) -> (usize, usize) {
    let head_end = messages
        .iter()
        .position(|m| m.role != Role::System)
        .unwrap_or(messages.len());
    let tail_start = recent_exchange_start(messages, keep_exchanges);
    (head_end, tail_start)
}

/// The messages [`summarize_middle`] would replace.
pub fn middle_messages(messages: &[Message], keep_exchanges: usize) -> &[Message] {
    let (head_end, tail_start) = middle_bounds(messages, keep_exchanges.max(1));
    if tail_start <= head_end {
        &[]
    } else {
        &messages[head_end..tail_start]
    }
}

/// Deterministic stand-in for an LLM summary: one line per message.
pub fn fallback_summary(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, preview(m.content.trim(), 160)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a message mentions something worth keeping under pressure.
pub fn is_critical(message: &Message) -> bool {
    CRITICAL_RE.is_match(&message.content)
}

/// Reduce to system ∪ critical ∪ last `keep_exchanges` exchanges.
///
/// Order is preserved and duplicates by (role, content) are dropped. The
/// system message and the most recent exchange always survive.
pub fn filter_critical(messages: Vec<Message>, keep_exchanges: usize) -> Vec<Message> {
    let tail_start = recent_exchange_start(&messages, keep_exchanges.max(1));
    let mut seen: HashSet<(Role, String)> = HashSet::new();
    let mut result = Vec::new();
    for (i, msg) in messages.into_iter().enumerate() {
        let keep = msg.role == Role::System || i >= tail_start || is_critical(&msg);
        if keep && seen.insert((msg.role, msg.content.clone())) {
            result.push(msg);
        }
    }
    result
}

/// Build a prompt asking an LLM to summarize a set of messages.
///
/// # Examples
/// ```
/// use speakmcp_core::session::Message;
/// use speakmcp_core::agent::compaction::build_summary_prompt;
///
/// let msgs = vec![
///     Message::user("Hello"),
///     Message::assistant("Hi there!"),
/// ];
/// let prompt = build_summary_prompt(&msgs);
/// assert!(prompt.contains("user: Hello"));
/// assert!(prompt.contains("assistant: Hi there!"));
/// ```
pub fn build_summary_prompt(messages: &[Message]) -> String {
    let mut transcript = String::new();
    for msg in messages {
        transcript.push_str(&format!("{}: {}\n", msg.role, msg.content));
    }
    format!(
        "Summarize the following conversation focusing on key decisions, \
         information exchanged, and actions taken. Keep identifiers, paths, \
         URLs and error messages verbatim. Be concise.\n\n{}",
        transcript
    )
}

/// Build a prompt asking an LLM to condense one large tool result.
pub fn build_tool_result_prompt(content: &str, max_chars: usize) -> String {
    format!(
        "Condense this tool output to under {} characters. Preserve every \
         field name, identifier, number, path and error message that a \
         follow-up step could need. Drop repetition and formatting.\n\n{}",
        max_chars, content
    )
}
