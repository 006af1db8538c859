//! MCP JSON-RPC 2.0 wire types and result normalization.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SpeakError};
use crate::session::ToolResult;

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC request or notification (notifications carry no id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// Any inbound frame: a response to one of our requests, or a request /
/// notification initiated by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Numeric id of a response. String ids holding digits are accepted too.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Whether this frame is a request initiated by the server.
    pub fn is_server_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// Turn a response frame into its result or a protocol error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(SpeakError::Mcp(error.to_string()));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({})", data)?;
        }
        Ok(())
    }
}

/// Reply to a server-initiated request. `ping` is answered; everything else
/// gets "method not found".
pub fn server_request_reply(msg: &JsonRpcMessage) -> Value {
    let id = msg.id.clone().unwrap_or(Value::Null);
    match msg.method.as_deref() {
        Some("ping") => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        Some(method) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": METHOD_NOT_FOUND, "message": format!("Method not found: {}", method)}
        }),
        None => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
    }
}

/// `initialize` request parameters.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "speakmcp",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Tool information from an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

/// One page of `tools/list`.
#[derive(Debug, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result. Content blocks stay raw so unknown block types survive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: Option<bool>,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Normalize heterogeneous content blocks into ordered text parts.
    pub fn into_tool_result(self) -> ToolResult {
        let is_error = self.is_error.unwrap_or(false);
        let mut parts: Vec<String> = self.content.iter().filter_map(block_to_text).collect();

        if parts.is_empty() {
            if let Some(structured) = &self.structured_content {
                parts.push(
                    serde_json::to_string_pretty(structured).unwrap_or_else(|_| structured.to_string()),
                );
            }
        }

        if parts.is_empty() && is_error {
            parts.push("Tool returned an error without details".to_string());
        }

        ToolResult {
            content: parts,
            is_error,
        }
    }
}

fn str_field<'a>(block: &'a Value, key: &str) -> Option<&'a str> {
    block.get(key).and_then(|v| v.as_str())
}

fn block_to_text(block: &Value) -> Option<String> {
    let kind = str_field(block, "type").unwrap_or("");
    match kind {
        "text" => str_field(block, "text").map(str::to_string),
        "image" | "audio" => {
            let mime = str_field(block, "mimeType").unwrap_or("unknown");
            let len = str_field(block, "data").map(str::len).unwrap_or(0);
            Some(format!("[{} content: {}, {} bytes base64]", kind, mime, len))
        }
        "resource" => {
            let resource = block.get("resource")?;
            match str_field(resource, "text") {
                Some(text) => Some(text.to_string()),
                None => Some(format!(
                    "[resource: {}]",
                    str_field(resource, "uri").unwrap_or("unknown")
                )),
            }
        }
        "resource_link" => Some(format!(
            "[resource link: {}]",
            str_field(block, "uri").unwrap_or("unknown")
        )),
        _ => Some(block.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::request(7, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));

        let note = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_response_routing_fields() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(msg.response_id(), Some(3));
        assert!(!msg.is_server_request());
        assert_eq!(msg.into_result().unwrap(), json!({"ok": true}));

        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"4","result":{}}"#).unwrap();
        assert_eq!(msg.response_id(), Some(4));

        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#).unwrap();
        assert_eq!(msg.response_id(), None);
        assert!(msg.is_server_request());
        assert_eq!(server_request_reply(&msg)["result"], json!({}));
    }

    #[test]
    fn test_error_response() {
        let msg: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid params"}}"#,
        )
        .unwrap();
        let err = msg.into_result().unwrap_err();
        assert!(err.to_string().contains("[-32602] Invalid params"));
    }

    #[test]
    fn test_unknown_server_request_gets_method_not_found() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":2,"method":"roots/list"}"#).unwrap();
        let reply = server_request_reply(&msg);
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(reply["id"], json!(2));
    }

    #[test]
    fn test_list_tools_page() {
        let page: ListToolsResult = serde_json::from_value(json!({
            "tools": [{"name": "read", "description": "Read", "inputSchema": {"type": "object"}}],
            "nextCursor": "abc"
        }))
        .unwrap();
        assert_eq!(page.tools[0].name, "read");
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_normalize_mixed_blocks() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///a.txt", "text": "file body"}},
                {"type": "resource", "resource": {"uri": "file:///b.bin", "blob": "AA"}},
                {"type": "mystery", "value": 1}
            ]
        }))
        .unwrap();
        let normalized = result.into_tool_result();
        assert!(!normalized.is_error);
        assert_eq!(normalized.content[0], "hello");
        assert_eq!(normalized.content[1], "[image content: image/png, 4 bytes base64]");
        assert_eq!(normalized.content[2], "file body");
        assert_eq!(normalized.content[3], "[resource: file:///b.bin]");
        assert!(normalized.content[4].contains("mystery"));
    }

    #[test]
    fn test_normalize_structured_content_fallback() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [],
            "structuredContent": {"count": 2}
        }))
        .unwrap();
        let normalized = result.into_tool_result();
        assert!(normalized.text().contains("\"count\": 2"));
    }

    #[test]
    fn test_normalize_empty_error() {
        let result: CallToolResult =
            serde_json::from_value(json!({"content": [], "isError": true})).unwrap();
        let normalized = result.into_tool_result();
        assert!(normalized.is_error);
        assert_eq!(normalized.content.len(), 1);
    }
}
