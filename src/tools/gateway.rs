//! Tool Execution Gateway.
//!
//! Owns one connection per configured tool provider, the registry of their
//! tools and the runtime enablement layer. All tool traffic from the agent
//! loop goes through [`ToolGateway::execute_tool_call`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::enablement::{ToolEnablement, ToolUsageStats};
use super::mcp::{CallToolResult, McpClient, McpTool};
use super::registry::ToolRegistry;
use super::types::{ToolDescriptor, ToolExecutor};
use crate::config::{McpConfig, McpServerConfig, McpTransportKind};
use crate::error::{Result, SpeakError};
use crate::session::{SessionRegistry, ToolCall, ToolResult};
use crate::utils::string::{camel_to_snake, snake_to_camel};

/// Error text that points at argument names the tool did not accept.
static SCHEMA_MISMATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(invalid|unknown|unexpected|unrecognized|missing|required)[ _-]+(argument|parameter|param|property|field|key)s?|validation error|invalid params|-32602|additional properties",
    )
    .expect("valid schema mismatch regex")
});

/// A connected provider as seen by the gateway.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;
    async fn close(&self, grace: Duration);
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl ProviderClient for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        McpClient::call_tool(self, name, arguments).await
    }

    async fn close(&self, grace: Duration) {
        McpClient::close(self, grace).await
    }

    fn is_connected(&self) -> bool {
        McpClient::is_connected(self)
    }
}

/// Opens provider connections. Swappable so the gateway can be driven
/// without real servers.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, name: &str, cfg: &McpServerConfig) -> Result<Arc<dyn ProviderClient>>;
}

/// Connects real MCP servers, tracking subprocesses in the session registry.
pub struct McpConnector {
    registry: Option<SessionRegistry>,
}

impl McpConnector {
    pub fn new(registry: Option<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    async fn connect(&self, name: &str, cfg: &McpServerConfig) -> Result<Arc<dyn ProviderClient>> {
        let client = McpClient::connect(name, cfg, self.registry.as_ref()).await?;
        Ok(Arc::new(client))
    }
}

struct ProviderConnection {
    transport: McpTransportKind,
    client: Arc<dyn ProviderClient>,
}

/// Outcome of [`ToolGateway::initialize`].
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    /// Newly connected providers with their tool counts.
    pub connected: Vec<(String, usize)>,
    /// Providers that failed, with the error text.
    pub failed: Vec<(String, String)>,
    /// Providers skipped with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Per-provider status for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub connected: bool,
    pub tool_count: usize,
    pub transport: McpTransportKind,
    pub runtime_disabled: bool,
    pub last_error: Option<String>,
}

/// The Tool Execution Gateway.
pub struct ToolGateway {
    config: RwLock<McpConfig>,
    connector: Arc<dyn ProviderConnector>,
    connections: RwLock<HashMap<String, ProviderConnection>>,
    tools: RwLock<ToolRegistry>,
    enablement: ToolEnablement,
    last_errors: Mutex<HashMap<String, String>>,
    init_lock: tokio::sync::Mutex<()>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ToolGateway {
    /// Gateway over real MCP servers.
    pub fn new(config: McpConfig, registry: Option<SessionRegistry>) -> Self {
        Self::with_connector(config, Arc::new(McpConnector::new(registry)))
    }

    pub fn with_connector(config: McpConfig, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            config: RwLock::new(config),
            connector,
            connections: RwLock::new(HashMap::new()),
            tools: RwLock::new(ToolRegistry::new()),
            enablement: ToolEnablement::new(),
            last_errors: Mutex::new(HashMap::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn last_errors(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.last_errors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the provider configuration, including runtime changes.
    pub fn mcp_config(&self) -> McpConfig {
        read(&self.config).clone()
    }

    fn client(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        read(&self.connections)
            .get(provider)
            .map(|c| Arc::clone(&c.client))
    }

    pub fn is_provider_connected(&self, provider: &str) -> bool {
        self.client(provider)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Connect every eligible provider concurrently.
    ///
    /// Providers disabled in config, disabled at runtime by the user, or
    /// already connected are skipped. One provider failing never blocks
    /// the others.
    pub async fn initialize(&self) -> InitReport {
        let _init = self.init_lock.lock().await;
        let (servers, runtime_disabled, connect_timeout) = {
            let cfg = read(&self.config);
            (
                cfg.servers.clone(),
                cfg.runtime_disabled_servers
                    .iter()
                    .cloned()
                    .collect::<HashSet<_>>(),
                Duration::from_millis(cfg.connect_timeout_ms),
            )
        };

        let mut report = InitReport::default();
        let mut eligible = Vec::new();
        for (name, server) in servers {
            if server.disabled {
                report.skipped.push((name, "disabled in config".into()));
            } else if runtime_disabled.contains(&name) {
                report.skipped.push((name, "disabled by user".into()));
            } else if self.is_provider_connected(&name) {
                report.skipped.push((name, "already connected".into()));
            } else {
                eligible.push((name, server));
            }
        }

        let attempts = eligible
            .iter()
            .map(|(name, server)| self.connect_provider(name, server, connect_timeout));
        let outcomes = join_all(attempts).await;

        for ((name, _), outcome) in eligible.into_iter().zip(outcomes) {
            match outcome {
                Ok(count) => report.connected.push((name, count)),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider failed to initialize, skipping");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            tools = read(&self.tools).len(),
            "Tool gateway initialized"
        );
        report
    }

    /// Connect one provider, list its tools and register them.
    async fn connect_provider(
        &self,
        name: &str,
        server: &McpServerConfig,
        connect_timeout: Duration,
    ) -> Result<usize> {
        let started = Instant::now();
        let attempt = async {
            let client = self.connector.connect(name, server).await?;
            match client.list_tools().await {
                Ok(tools) => Ok((client, tools)),
                Err(e) => {
                    client.close(Duration::from_millis(500)).await;
                    Err(e)
                }
            }
        };

        let outcome = match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SpeakError::Timeout(format!(
                "provider '{}' did not connect within {}ms",
                name,
                connect_timeout.as_millis()
            ))),
        };

        let (client, tools) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                self.last_errors().insert(name.to_string(), e.to_string());
                return Err(e);
            }
        };

        let descriptors: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|t| {
                ToolDescriptor::new(
                    name,
                    &t.name,
                    t.description.as_deref().unwrap_or(""),
                    t.input_schema
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                )
            })
            .collect();
        let count = write(&self.tools).register_provider(name, descriptors);

        let previous = write(&self.connections).insert(
            name.to_string(),
            ProviderConnection {
                transport: server.transport,
                client,
            },
        );
        if let Some(previous) = previous {
            previous.client.close(Duration::from_millis(500)).await;
        }
        self.last_errors().remove(name);

        info!(
            provider = %name,
            transport = %server.transport,
            tools = count,
            duration_ms = started.elapsed().as_millis() as u64,
            "Provider connected"
        );
        Ok(count)
    }

    /// Disconnect a provider and drop its tools. Returns whether it was connected.
    pub async fn stop_provider(&self, name: &str) -> bool {
        let removed = write(&self.connections).remove(name);
        write(&self.tools).unregister_provider(name);
        match removed {
            Some(conn) => {
                let grace = Duration::from_millis(read(&self.config).shutdown_grace_ms);
                conn.client.close(grace).await;
                info!(provider = %name, "Provider stopped");
                true
            }
            None => false,
        }
    }

    /// Stop and reconnect a provider from its current configuration.
    pub async fn restart_provider(&self, name: &str) -> Result<usize> {
        let _init = self.init_lock.lock().await;
        let (server, connect_timeout) = {
            let cfg = read(&self.config);
            let server = cfg
                .servers
                .get(name)
                .cloned()
                .ok_or_else(|| SpeakError::NotFound(format!("provider '{}'", name)))?;
            (server, Duration::from_millis(cfg.connect_timeout_ms))
        };
        self.stop_provider(name).await;
        self.connect_provider(name, &server, connect_timeout).await
    }

    /// Connect with `cfg`, count its tools, disconnect. Nothing is registered.
    pub async fn test_connection(&self, name: &str, cfg: &McpServerConfig) -> Result<usize> {
        let connect_timeout = Duration::from_millis(read(&self.config).connect_timeout_ms);
        let attempt = async {
            let client = self.connector.connect(name, cfg).await?;
            let listed = client.list_tools().await;
            client.close(Duration::from_millis(500)).await;
            listed.map(|tools| tools.len())
        };
        match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SpeakError::Timeout(format!(
                "provider '{}' did not respond within {}ms",
                name,
                connect_timeout.as_millis()
            ))),
        }
    }

    /// Persisted runtime enable/disable of a whole provider.
    ///
    /// Disabling stops it immediately; enabling connects it unless it is
    /// disabled in config.
    pub async fn set_provider_runtime_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let server = {
            let mut cfg = write(&self.config);
            let server = cfg
                .servers
                .get(name)
                .cloned()
                .ok_or_else(|| SpeakError::NotFound(format!("provider '{}'", name)))?;
            cfg.runtime_disabled_servers.retain(|n| n != name);
            if !enabled {
                cfg.runtime_disabled_servers.push(name.to_string());
            }
            server
        };

        if !enabled {
            self.stop_provider(name).await;
            return Ok(());
        }
        if server.disabled || self.is_provider_connected(name) {
            return Ok(());
        }
        self.restart_provider(name).await.map(|_| ())
    }

    /// Effective state: allowed by the persisted disabled set AND the runtime layer.
    pub fn is_tool_enabled(&self, name: &str) -> bool {
        let legacy_disabled = read(&self.config).disabled_tools.iter().any(|t| t == name);
        !legacy_disabled && self.enablement.is_enabled(name)
    }

    /// Enable or disable a registered tool in both layers.
    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let qualified = read(&self.tools)
            .resolve(name)
            .map(|d| d.name.clone())
            .ok_or_else(|| SpeakError::NotFound(format!("tool '{}'", name)))?;
        {
            let mut cfg = write(&self.config);
            cfg.disabled_tools.retain(|t| t != &qualified);
            if !enabled {
                cfg.disabled_tools.push(qualified.clone());
            }
        }
        self.enablement.set_enabled(&qualified, enabled);
        info!(tool = %qualified, enabled, "Tool enablement changed");
        Ok(())
    }

    /// Block a tool for `duration`; it comes back on its own.
    pub fn disable_tool_for(&self, name: &str, duration: Duration) -> Result<()> {
        let qualified = read(&self.tools)
            .resolve(name)
            .map(|d| d.name.clone())
            .ok_or_else(|| SpeakError::NotFound(format!("tool '{}'", name)))?;
        self.enablement.disable_for(&qualified, duration);
        Ok(())
    }

    pub fn tool_stats(&self, name: &str) -> Option<ToolUsageStats> {
        self.enablement.stats(name)
    }

    pub fn all_tool_stats(&self) -> HashMap<String, ToolUsageStats> {
        self.enablement.all_stats()
    }

    /// Every registered tool with its effective enabled flag.
    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = read(&self.tools).descriptors();
        for tool in &mut tools {
            tool.enabled = self.is_tool_enabled(&tool.name);
        }
        tools
    }

    /// Tools the decision maker may call right now.
    pub fn get_available_tools(&self) -> Vec<ToolDescriptor> {
        self.get_all_tools()
            .into_iter()
            .filter(|t| t.enabled)
            .collect()
    }

    pub fn get_provider_status(&self) -> BTreeMap<String, ProviderStatus> {
        let cfg = self.mcp_config();
        let connections = read(&self.connections);
        let tools = read(&self.tools);
        let errors = self.last_errors();
        cfg.servers
            .iter()
            .map(|(name, server)| {
                let status = ProviderStatus {
                    connected: connections
                        .get(name)
                        .map(|c| c.client.is_connected())
                        .unwrap_or(false),
                    tool_count: tools.provider_tools(name).len(),
                    transport: connections
                        .get(name)
                        .map(|c| c.transport)
                        .unwrap_or(server.transport),
                    runtime_disabled: cfg.runtime_disabled_servers.contains(name),
                    last_error: errors.get(name).cloned(),
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// Execute one call against its provider.
    ///
    /// Never fails: lookup, enablement, transport and tool errors all come
    /// back as an error [`ToolResult`] the decision maker can react to.
    pub async fn execute_tool_call(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let resolved = read(&self.tools).resolve(&call.name).cloned();
        let descriptor = match resolved {
            Some(d) => d,
            None => {
                let available = self
                    .get_available_tools()
                    .into_iter()
                    .map(|t| t.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                return ToolResult::error(format!(
                    "Tool not found: {}. Available tools: {}",
                    call.name, available
                ));
            }
        };

        if !self.is_tool_enabled(&descriptor.name) {
            return ToolResult::error(format!("Tool {} is currently disabled", descriptor.name));
        }

        let client = match self.client(&descriptor.provider) {
            Some(c) => c,
            None => {
                return ToolResult::error(format!(
                    "Provider {} is not connected",
                    descriptor.provider
                ))
            }
        };

        let started = Instant::now();
        let mut result = call_provider(&*client, &descriptor, call.arguments.clone(), cancel).await;

        if result.is_error
            && !cancel.is_cancelled()
            && SCHEMA_MISMATCH_RE.is_match(&result.text())
        {
            if let Some(corrected) =
                correct_argument_keys(&call.arguments, &descriptor.schema_properties())
            {
                info!(
                    tool = %descriptor.name,
                    original = %call.arguments,
                    corrected = %corrected,
                    "Retrying tool call with corrected argument names"
                );
                result = call_provider(&*client, &descriptor, corrected, cancel).await;
            }
        }

        let elapsed = started.elapsed();
        self.enablement
            .record(&descriptor.name, !result.is_error, elapsed);
        debug!(
            tool = %descriptor.name,
            is_error = result.is_error,
            duration_ms = elapsed.as_millis() as u64,
            "Tool call finished"
        );
        result
    }

    /// Close every provider.
    pub async fn shutdown(&self) {
        let grace = Duration::from_millis(read(&self.config).shutdown_grace_ms);
        let drained: Vec<(String, ProviderConnection)> = write(&self.connections).drain().collect();
        write(&self.tools).clear();
        let closes = drained.iter().map(|(name, conn)| async move {
            conn.client.close(grace).await;
            debug!(provider = %name, "Provider closed");
        });
        join_all(closes).await;
        info!(providers = drained.len(), "Tool gateway shut down");
    }
}

async fn call_provider(
    client: &dyn ProviderClient,
    descriptor: &ToolDescriptor,
    arguments: Value,
    cancel: &CancellationToken,
) -> ToolResult {
    tokio::select! {
        _ = cancel.cancelled() => {
            ToolResult::error(format!("Tool {} was cancelled", descriptor.name))
        }
        outcome = client.call_tool(&descriptor.tool_name, arguments) => match outcome {
            Ok(result) => result.into_tool_result(),
            Err(e) => ToolResult::error(format!(
                "Error executing tool {}: {}",
                descriptor.name, e
            )),
        }
    }
}

/// Rename argument keys between snake_case and camelCase.
///
/// With schema properties available, a key is renamed only when its other
/// casing is a declared property. Without a schema every convertible key is
/// flipped. Returns `None` when nothing changed.
pub fn correct_argument_keys(arguments: &Value, properties: &[String]) -> Option<Value> {
    let object = arguments.as_object()?;
    let mut corrected = Map::with_capacity(object.len());
    let mut changed = false;

    for (key, value) in object {
        let renamed = if properties.is_empty() {
            flip_case(key)
        } else if properties.iter().any(|p| p == key) {
            None
        } else {
            [snake_to_camel(key), camel_to_snake(key)]
                .into_iter()
                .find(|candidate| candidate != key && properties.contains(candidate))
        };
        match renamed {
            Some(new_key) => {
                changed = true;
                corrected.insert(new_key, value.clone());
            }
            None => {
                corrected.insert(key.clone(), value.clone());
            }
        }
    }

    changed.then_some(Value::Object(corrected))
}

fn flip_case(key: &str) -> Option<String> {
    let flipped = if key.contains('_') {
        snake_to_camel(key)
    } else if key.chars().any(|c| c.is_ascii_uppercase()) {
        camel_to_snake(key)
    } else {
        return None;
    };
    (flipped != key).then_some(flipped)
}

#[async_trait]
impl ToolExecutor for ToolGateway {
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        self.execute_tool_call(call, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process provider with `echo`, `slow` and a strict `create_item`
    /// that only accepts camelCase keys.
    struct FakeClient {
        calls: AtomicUsize,
        connected: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ProviderClient for FakeClient {
        async fn list_tools(&self) -> Result<Vec<McpTool>> {
            Ok(vec![
                McpTool {
                    name: "echo".into(),
                    description: Some("Echo".into()),
                    input_schema: None,
                },
                McpTool {
                    name: "slow".into(),
                    description: None,
                    input_schema: None,
                },
                McpTool {
                    name: "create_item".into(),
                    description: None,
                    input_schema: Some(json!({
                        "type": "object",
                        "properties": {"itemName": {"type": "string"}}
                    })),
                },
            ])
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = match name {
                "echo" => arguments.to_string(),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late".to_string()
                }
                "create_item" if arguments.get("itemName").is_some() => "created".to_string(),
                "create_item" => {
                    return Ok(CallToolResult {
                        content: vec![json!({"type": "text", "text": "Invalid arguments: unknown field item_name"})],
                        is_error: Some(true),
                        structured_content: None,
                    })
                }
                _ => return Err(SpeakError::Mcp("no such tool".into())),
            };
            Ok(CallToolResult {
                content: vec![json!({"type": "text", "text": text})],
                ..Default::default()
            })
        }

        async fn close(&self, _grace: Duration) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Connects any provider whose command is not "fail".
    struct FakeConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ProviderConnector for FakeConnector {
        async fn connect(
            &self,
            name: &str,
            cfg: &McpServerConfig,
        ) -> Result<Arc<dyn ProviderClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match cfg.command.as_deref() {
                Some("fail") => Err(SpeakError::Transport(format!("{} refused", name))),
                Some("hang") => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(SpeakError::Transport("unreachable".into()))
                }
                _ => Ok(Arc::new(FakeClient {
                    calls: AtomicUsize::new(0),
                    connected: std::sync::atomic::AtomicBool::new(true),
                })),
            }
        }
    }

    fn config(servers: &[(&str, &str)]) -> McpConfig {
        let mut cfg = McpConfig {
            connect_timeout_ms: 200,
            shutdown_grace_ms: 10,
            ..Default::default()
        };
        for (name, command) in servers {
            cfg.servers
                .insert(name.to_string(), McpServerConfig::stdio(command, &[]));
        }
        cfg
    }

    fn gateway(cfg: McpConfig) -> (ToolGateway, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector {
            connects: AtomicUsize::new(0),
        });
        (ToolGateway::with_connector(cfg, connector.clone()), connector)
    }

    #[tokio::test]
    async fn test_initialize_isolates_failures() {
        let (gw, _) = gateway(config(&[("good", "ok"), ("bad", "fail"), ("stuck", "hang")]));
        let report = gw.initialize().await;

        assert_eq!(report.connected, vec![("good".to_string(), 3)]);
        assert_eq!(report.failed.len(), 2);
        assert!(gw.get_all_tools().iter().all(|t| t.provider == "good"));

        let status = gw.get_provider_status();
        assert!(status["good"].connected);
        assert_eq!(status["good"].tool_count, 3);
        assert!(!status["bad"].connected);
        assert!(status["bad"].last_error.as_deref().unwrap().contains("refused"));
        assert!(status["stuck"].last_error.is_some());
    }

    #[tokio::test]
    async fn test_initialize_skips_disabled_and_connected() {
        let mut cfg = config(&[("a", "ok"), ("b", "ok"), ("c", "ok")]);
        cfg.servers.get_mut("b").unwrap().disabled = true;
        cfg.runtime_disabled_servers.push("c".into());
        let (gw, connector) = gateway(cfg);

        let report = gw.initialize().await;
        assert_eq!(report.connected.len(), 1);
        assert_eq!(report.skipped.len(), 2);

        let again = gw.initialize().await;
        assert!(again.connected.is_empty());
        assert!(again
            .skipped
            .iter()
            .any(|(n, why)| n == "a" && why == "already connected"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_by_prefix_and_bare_name() {
        let (gw, _) = gateway(config(&[("files", "ok")]));
        gw.initialize().await;
        let cancel = CancellationToken::new();

        let call = ToolCall::new("1", "files:echo", json!({"x": 1}));
        let result = gw.execute_tool_call(&call, &cancel).await;
        assert!(!result.is_error);
        assert_eq!(result.text(), r#"{"x":1}"#);

        let call = ToolCall::new("2", "other:echo", json!({}));
        assert!(!gw.execute_tool_call(&call, &cancel).await.is_error);

        let call = ToolCall::new("3", "missing", json!({}));
        let result = gw.execute_tool_call(&call, &cancel).await;
        assert!(result.is_error);
        assert!(result.text().contains("Available tools"));

        let stats = gw.tool_stats("files:echo").unwrap();
        assert_eq!(stats.success_count, 2);
    }

    #[tokio::test]
    async fn test_schema_mismatch_corrects_keys_once() {
        let (gw, _) = gateway(config(&[("store", "ok")]));
        gw.initialize().await;
        let call = ToolCall::new("1", "store:create_item", json!({"item_name": "pen"}));
        let result = gw.execute_tool_call(&call, &CancellationToken::new()).await;
        assert!(!result.is_error, "{}", result.text());
        assert_eq!(result.text(), "created");
    }

    #[tokio::test]
    async fn test_enablement_is_conjunctive() {
        let mut cfg = config(&[("files", "ok")]);
        cfg.disabled_tools.push("files:echo".into());
        let (gw, _) = gateway(cfg);
        gw.initialize().await;

        assert!(!gw.is_tool_enabled("files:echo"));
        assert_eq!(gw.get_available_tools().len(), 2);
        let result = gw
            .execute_tool_call(
                &ToolCall::new("1", "files:echo", json!({})),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.text().contains("disabled"));

        gw.set_tool_enabled("files:echo", true).unwrap();
        assert!(gw.is_tool_enabled("files:echo"));
        assert!(gw.mcp_config().disabled_tools.is_empty());

        gw.disable_tool_for("echo", Duration::from_secs(60)).unwrap();
        assert!(!gw.is_tool_enabled("files:echo"));
        assert!(gw.set_tool_enabled("nope", false).is_err());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_tool_call() {
        let (gw, _) = gateway(config(&[("files", "ok")]));
        gw.initialize().await;
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let result = gw
            .execute_tool_call(&ToolCall::new("1", "files:slow", json!({})), &cancel)
            .await;
        assert!(result.is_error);
        assert!(result.text().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_stop_restart_and_runtime_disable() {
        let (gw, connector) = gateway(config(&[("files", "ok")]));
        gw.initialize().await;

        assert!(gw.stop_provider("files").await);
        assert!(gw.get_all_tools().is_empty());
        assert!(!gw.stop_provider("files").await);

        assert_eq!(gw.restart_provider("files").await.unwrap(), 3);
        assert!(gw.restart_provider("unknown").await.is_err());

        gw.set_provider_runtime_enabled("files", false).await.unwrap();
        assert!(!gw.is_provider_connected("files"));
        assert_eq!(gw.mcp_config().runtime_disabled_servers, vec!["files"]);
        assert!(gw.initialize().await.connected.is_empty());

        gw.set_provider_runtime_enabled("files", true).await.unwrap();
        assert!(gw.is_provider_connected("files"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_test_connection_registers_nothing() {
        let (gw, _) = gateway(config(&[]));
        let count = gw
            .test_connection("check", &McpServerConfig::stdio("ok", &[]))
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert!(gw.get_all_tools().is_empty());
        assert!(gw
            .test_connection("check", &McpServerConfig::stdio("fail", &[]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let (gw, _) = gateway(config(&[("a", "ok"), ("b", "ok")]));
        gw.initialize().await;
        assert_eq!(gw.get_all_tools().len(), 6);
        gw.shutdown().await;
        assert!(gw.get_all_tools().is_empty());
        assert!(!gw.is_provider_connected("a"));
    }

    #[test]
    fn test_correct_argument_keys() {
        let props = vec!["itemName".to_string(), "count".to_string()];
        assert_eq!(
            correct_argument_keys(&json!({"item_name": "x", "count": 1}), &props),
            Some(json!({"itemName": "x", "count": 1}))
        );
        assert_eq!(correct_argument_keys(&json!({"count": 1}), &props), None);

        assert_eq!(
            correct_argument_keys(&json!({"filePath": "/a", "mode": "r"}), &[]),
            Some(json!({"file_path": "/a", "mode": "r"}))
        );
        assert_eq!(correct_argument_keys(&json!("text"), &[]), None);
    }

    #[test]
    fn test_schema_mismatch_vocabulary() {
        for text in [
            "Invalid arguments: unknown field",
            "MCP error: [-32602] Invalid params",
            "missing required parameter: path",
            "Validation error on input",
        ] {
            assert!(SCHEMA_MISMATCH_RE.is_match(text), "{}", text);
        }
        assert!(!SCHEMA_MISMATCH_RE.is_match("file not found"));
    }
}
