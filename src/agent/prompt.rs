//! System prompt construction.
//!
//! Tools are described in the prompt rather than through a native
//! tool-calling API, and the model answers with one JSON decision object.

use std::collections::HashSet;

use crate::tools::ToolDescriptor;

use super::compaction::SCHEMA_LINE_PREFIX;

/// Default instructions when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous assistant that completes tasks \
by calling the tools available to you. Work step by step, inspect tool results before \
deciding what to do next, and stop as soon as the request is satisfied.";

/// Decision format every completion must follow.
pub const DECISION_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "content": "text for the user, or your reasoning when calling tools",
  "toolCalls": [{"name": "provider:tool", "arguments": {}}],
  "needsMoreWork": true
}
- Call tools by their full name, exactly as listed.
- Omit "toolCalls" when no tool is needed.
- Set "needsMoreWork" to false only when the task is complete and "content" holds the final answer."#;

/// Injected when the model neither acts nor finishes.
pub const NUDGE_MESSAGE: &str = "You have not called a tool or finished the task. Either call \
one of the available tools now, or respond with your final answer and \"needsMoreWork\": false.";

/// Asks for a readable wrap-up after a terse completion.
pub const SUMMARY_REQUEST: &str = "Summarize what you did and what the results were for the \
user in a few sentences. Respond with the JSON decision format, \"needsMoreWork\": false.";

/// Build the system prompt listing `tools` and the decision format.
///
/// # Examples
/// ```
/// use serde_json::json;
/// use speakmcp_core::agent::prompt::build_system_prompt;
/// use speakmcp_core::tools::ToolDescriptor;
///
/// let tool = ToolDescriptor::new("files", "read", "Read a file", json!({
///     "type": "object",
///     "properties": {"path": {"type": "string"}},
///     "required": ["path"]
/// }));
/// let prompt = build_system_prompt(None, &[tool]);
/// assert!(prompt.contains("- files:read(path*): Read a file"));
/// assert!(prompt.contains("needsMoreWork"));
/// ```
pub fn build_system_prompt(base: Option<&str>, tools: &[ToolDescriptor]) -> String {
    let mut prompt = base
        .filter(|b| !b.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .trim()
        .to_string();

    prompt.push_str("\n\n");
    if tools.is_empty() {
        prompt.push_str("No tools are available. Answer directly.");
    } else {
        prompt.push_str("Available tools:\n");
        for tool in tools {
            prompt.push_str(&format!("- {}: {}\n", tool.compact_signature(), tool.description));
            if !tool.input_schema.is_null() {
                prompt.push_str(&format!("{} {}\n", SCHEMA_LINE_PREFIX, tool.input_schema));
            }
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(DECISION_FORMAT);
    prompt
}

/// Whether the request looks like it needs one of `tools`.
///
/// True when a distinctive word of some tool's name (four characters or
/// more) appears in the prompt.
pub fn tools_relevant(prompt: &str, tools: &[ToolDescriptor]) -> bool {
    let words: HashSet<String> = prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    tools.iter().any(|tool| {
        tool.tool_name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|part| part.chars().count() >= 4)
            .any(|part| words.contains(&part.to_lowercase()))
    })
}
