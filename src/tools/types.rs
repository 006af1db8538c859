//! Tool types for SpeakMCP core
//!
//! This module defines the [`ToolDescriptor`] registered by the gateway for
//! every provider tool, and the [`ToolExecutor`] trait through which the agent
//! loop runs tool calls without knowing where they go.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::session::{ToolCall, ToolResult};

/// Separator between provider name and tool name in fully-qualified names.
pub const TOOL_NAME_SEPARATOR: char = ':';

/// A registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Fully-qualified name: `provider:tool`
    pub name: String,
    /// Provider that hosts the tool
    pub provider: String,
    /// Name of the tool on the provider (unprefixed)
    pub tool_name: String,
    pub description: String,
    /// JSON schema of the argument object
    pub input_schema: Value,
    /// Effective enabled state at the time the descriptor was produced
    pub enabled: bool,
}

impl ToolDescriptor {
    pub fn new(provider: &str, tool_name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: qualified_name(provider, tool_name),
            provider: provider.to_string(),
            tool_name: tool_name.to_string(),
            description: description.to_string(),
            input_schema,
            enabled: true,
        }
    }

    /// Property names declared by the input schema.
    pub fn schema_properties(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// One-line signature such as `files:read(path*, encoding)`.
    ///
    /// Required parameters carry a `*`.
    pub fn compact_signature(&self) -> String {
        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let params: Vec<String> = self
            .schema_properties()
            .into_iter()
            .map(|p| {
                if required.contains(&p.as_str()) {
                    format!("{}*", p)
                } else {
                    p
                }
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

/// Build a fully-qualified tool name.
pub fn qualified_name(provider: &str, tool_name: &str) -> String {
    format!("{}{}{}", provider, TOOL_NAME_SEPARATOR, tool_name)
}

/// Split `provider:tool` into its parts. Names without a separator yield `None`.
pub fn split_qualified_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_NAME_SEPARATOR)
}

/// Runs tool calls on behalf of the agent loop.
///
/// Implementations never fail: problems are reported as error results so the
/// decision maker can see them and self-correct.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use speakmcp_core::session::{ToolCall, ToolResult};
/// use speakmcp_core::tools::ToolExecutor;
/// use tokio_util::sync::CancellationToken;
///
/// struct Echo;
///
/// #[async_trait]
/// impl ToolExecutor for Echo {
///     async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolResult {
///         ToolResult::ok(call.arguments.to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one call. `cancel` is tripped when the owning run is stopped.
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_qualified_name() {
        let d = ToolDescriptor::new("files", "read", "Read a file", json!({}));
        assert_eq!(d.name, "files:read");
        assert_eq!(split_qualified_name(&d.name), Some(("files", "read")));
        assert_eq!(split_qualified_name("bare"), None);
    }

    #[test]
    fn test_compact_signature_marks_required() {
        let d = ToolDescriptor::new(
            "files",
            "read",
            "Read a file",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "encoding": {"type": "string"}},
                "required": ["path"]
            }),
        );
        let sig = d.compact_signature();
        assert!(sig.starts_with("files:read("));
        assert!(sig.contains("path*"));
        assert!(sig.contains("encoding"));
        assert!(!sig.contains("encoding*"));
    }

    #[test]
    fn test_schema_properties_missing() {
        let d = ToolDescriptor::new("p", "t", "", json!({"type": "object"}));
        assert!(d.schema_properties().is_empty());
        assert_eq!(d.compact_signature(), "p:t()");
    }
}
