//! Conversation types for SpeakMCP core
//!
//! This module defines the value types exchanged between the agent loop, the
//! tool gateway and the conversation store: messages, roles, tool calls and
//! normalized tool results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A conversation: an append-only message history keyed by conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier for this conversation
    pub id: String,
    /// Ordered list of messages in this conversation
    pub messages: Vec<Message>,
    /// When this conversation was created
    pub created_at: DateTime<Utc>,
    /// When this conversation was last modified
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation with the given id.
    ///
    /// # Example
    /// ```
    /// use speakmcp_core::session::Conversation;
    ///
    /// let conversation = Conversation::new("conv_1");
    /// assert!(conversation.messages.is_empty());
    /// ```
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message and bump `updated_at`.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Replace the history wholesale (used after an agent run returns its audit history).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.updated_at = Utc::now();
    }

    /// Get the last message in this conversation, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// A single message in a conversation.
///
/// Messages can be from users, assistants, system prompts, or tool results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The text content of the message
    pub content: String,
    /// Tool calls made by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Results of the tool calls this message reports on (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
    /// ID of the native tool call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            tool_call_id: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a new user message.
    ///
    /// # Example
    /// ```
    /// use speakmcp_core::session::{Message, Role};
    ///
    /// let msg = Message::user("List my files");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a tool message answering a native tool call.
    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg
    }

    /// Create a tool message carrying a batch of normalized results.
    ///
    /// `content` is the rendered text the completion capability sees; the
    /// structured results are kept alongside for audit and UI rendering.
    pub fn tool_results(content: &str, results: Vec<ToolResult>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_results = Some(results);
        msg
    }

    /// Create an assistant message with tool calls.
    ///
    /// # Example
    /// ```
    /// use speakmcp_core::session::{Message, ToolCall};
    /// use serde_json::json;
    ///
    /// let call = ToolCall::new("call_1", "files:list", json!({"path": "/tmp"}));
    /// let msg = Message::assistant_with_tools("Listing.", vec![call]);
    /// assert!(msg.has_tool_calls());
    /// ```
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Check if this message has tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|tc| !tc.is_empty())
            .unwrap_or(false)
    }

    /// Check if this is a tool result message.
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompts and instructions
    System,
    /// Messages from the user
    User,
    /// Messages from the AI assistant
    Assistant,
    /// Results from tool executions
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call planned by the decision maker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    #[serde(default)]
    pub id: String,
    /// Tool name, normally fully qualified as `provider:tool`
    pub name: String,
    /// Argument map
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    /// Parse the arguments as a specific type.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.arguments.clone())
    }

    /// Arguments encoded as a JSON string (wire format of chat completion APIs).
    pub fn arguments_json(&self) -> String {
        self.arguments.to_string()
    }
}

/// Normalized outcome of a tool call: ordered text parts plus an error flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Ordered text parts
    pub content: Vec<String>,
    /// Whether the tool reported (or the gateway produced) an error
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result with a single text part.
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
            is_error: false,
        }
    }

    /// Error result with a single text part.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
            is_error: true,
        }
    }

    /// All text parts joined by newlines; `(no output)` when empty.
    pub fn text(&self) -> String {
        if self.content.is_empty() {
            "(no output)".to_string()
        } else {
            self.content.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_add_and_replace() {
        let mut conversation = Conversation::new("c1");
        conversation.add_message(Message::user("hello"));
        assert_eq!(conversation.messages.len(), 1);
        conversation.replace_messages(vec![Message::user("a"), Message::assistant("b")]);
        assert_eq!(conversation.last_message().unwrap().role, Role::Assistant);
        assert!(conversation.created_at <= conversation.updated_at);
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::system("s").role, Role::System);

        let msg = Message::tool_result("call_123", "Success");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
        assert!(msg.is_tool_result());
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_message_with_tool_calls() {
        let call = ToolCall::new("call_1", "web:search", json!({"q": "rust"}));
        let msg = Message::assistant_with_tools("Searching...", vec![call]);
        assert!(msg.has_tool_calls());
        assert!(!Message::assistant("plain").has_tool_calls());
    }

    #[test]
    fn test_message_serialization_is_camel_case_and_skips_none() {
        let msg = Message::tool_results("done", vec![ToolResult::ok("x")]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"toolResults\""));
        assert!(json.contains("\"isError\":false"));
        assert!(!json.contains("toolCalls"));
        assert!(!json.contains("toolCallId"));
    }

    #[test]
    fn test_role_serialize() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, r#""assistant""#);
        let parsed: Role = serde_json::from_str(r#""tool""#).unwrap();
        assert_eq!(parsed, Role::Tool);
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_tool_call_parse_arguments() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct SearchArgs {
            query: String,
        }

        let call = ToolCall::new("call_1", "search", json!({"query": "rust"}));
        let args: SearchArgs = call.parse_arguments().unwrap();
        assert_eq!(args.query, "rust");
        assert_eq!(call.arguments_json(), r#"{"query":"rust"}"#);
    }

    #[test]
    fn test_tool_call_defaults_missing_arguments() {
        let call: ToolCall = serde_json::from_str(r#"{"name": "files:list"}"#).unwrap();
        assert!(call.id.is_empty());
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_tool_result_text() {
        let result = ToolResult {
            content: vec!["a".into(), "b".into()],
            is_error: false,
        };
        assert_eq!(result.text(), "a\nb");
        assert_eq!(ToolResult::default().text(), "(no output)");
        assert!(ToolResult::error("boom").is_error);
    }
}
