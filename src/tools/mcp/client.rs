//! MCP client: handshake, paginated tool listing and tool calls over any
//! [`McpTransport`].

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::protocol::{initialize_params, CallToolResult, ListToolsResult, McpTool};
use super::transport::{self, McpTransport};
use crate::config::McpServerConfig;
use crate::error::Result;
use crate::session::SessionRegistry;

/// Safety cap on `tools/list` pages.
const MAX_LIST_PAGES: usize = 50;

/// Default per-request timeout when the provider config has none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A connected, initialized MCP session with one provider.
pub struct McpClient {
    name: String,
    transport: Box<dyn McpTransport>,
    request_timeout: Duration,
    server_info: Option<Value>,
}

impl McpClient {
    /// Wrap an already-open transport. Call [`initialize`](Self::initialize) next.
    pub fn new(name: &str, transport: Box<dyn McpTransport>, request_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            transport,
            request_timeout,
            server_info: None,
        }
    }

    /// Open the configured transport and run the handshake.
    pub async fn connect(
        name: &str,
        cfg: &McpServerConfig,
        registry: Option<&SessionRegistry>,
    ) -> Result<Self> {
        let timeout = cfg
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let transport = transport::connect(name, cfg, registry).await?;
        let mut client = Self::new(name, transport, timeout);
        if let Err(e) = client.initialize().await {
            client.close(Duration::from_millis(500)).await;
            return Err(e);
        }
        Ok(client)
    }

    /// `initialize` request followed by `notifications/initialized`.
    pub async fn initialize(&mut self) -> Result<()> {
        let result = self
            .transport
            .request("initialize", Some(initialize_params()), self.request_timeout)
            .await?;
        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let protocol = result
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        self.server_info = Some(result);
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        info!(
            provider = %self.name,
            server = %server_name,
            protocol = %protocol,
            "MCP session initialized"
        );
        Ok(())
    }

    /// All tools, following `nextCursor` until exhausted.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let raw = self
                .transport
                .request("tools/list", params, self.request_timeout)
                .await?;
            let page: ListToolsResult = serde_json::from_value(raw)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    debug!(provider = %self.name, tools = tools.len(), "Listed tools");
                    return Ok(tools);
                }
            }
        }
        warn!(provider = %self.name, "tools/list pagination did not terminate, truncating");
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let raw = self
            .transport
            .request("tools/call", Some(params), self.request_timeout)
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn close(&self, grace: Duration) {
        self.transport.close(grace).await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// `initialize` result as returned by the server.
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpeakError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type SentLog = Arc<Mutex<Vec<(String, Option<Value>)>>>;

    /// Replays canned results per method and records what was sent.
    struct ScriptedTransport {
        sent: SentLog,
        pages: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
            _timeout: Duration,
        ) -> Result<Value> {
            self.sent
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));
            match method {
                "initialize" => Ok(json!({
                    "protocolVersion": "2025-03-26",
                    "serverInfo": {"name": "scripted"}
                })),
                "tools/list" => Ok(self.pages.lock().unwrap().remove(0)),
                "tools/call" => Ok(json!({
                    "content": [{"type": "text", "text": params.unwrap()["name"].as_str().unwrap()}]
                })),
                other => Err(SpeakError::Mcp(format!("unexpected {}", other))),
            }
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
            self.sent.lock().unwrap().push((method.to_string(), params));
            Ok(())
        }

        async fn close(&self, _grace: Duration) {}

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn scripted(pages: Vec<Value>) -> (McpClient, SentLog) {
        let sent = SentLog::default();
        let transport = Box::new(ScriptedTransport {
            sent: Arc::clone(&sent),
            pages: Mutex::new(pages),
        });
        (McpClient::new("s", transport, Duration::from_secs(1)), sent)
    }

    #[tokio::test]
    async fn test_initialize_sends_handshake() {
        let (mut client, sent) = scripted(vec![]);
        client.initialize().await.unwrap();
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent[0].0, "initialize");
        assert_eq!(
            sent[0].1.as_ref().unwrap()["protocolVersion"],
            json!("2025-03-26")
        );
        assert_eq!(sent[1].0, "notifications/initialized");
        assert_eq!(
            client.server_info().unwrap()["serverInfo"]["name"],
            json!("scripted")
        );
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (client, sent) = scripted(vec![
            json!({"tools": [{"name": "a"}], "nextCursor": "page2"}),
            json!({"tools": [{"name": "b"}]}),
        ]);
        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let sent = sent.lock().unwrap().clone();
        assert!(sent[0].1.is_none());
        assert_eq!(sent[1].1, Some(json!({"cursor": "page2"})));
    }

    #[tokio::test]
    async fn test_call_tool_parses_result() {
        let (client, _) = scripted(vec![]);
        let result = client.call_tool("read", json!({"path": "/"})).await.unwrap();
        assert_eq!(result.into_tool_result().text(), "read");
    }
}
