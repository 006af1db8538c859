//! MCP transports: stdio subprocess, WebSocket and streamable HTTP.
//!
//! Every transport exposes the same request/notify/close surface. Stdio and
//! WebSocket are full-duplex: a reader task routes responses to waiting
//! requests by id and answers server-initiated requests. Streamable HTTP
//! carries each response in the body of its POST, either as JSON or as an
//! SSE stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{server_request_reply, JsonRpcMessage, JsonRpcRequest};
use crate::config::{McpServerConfig, McpTransportKind};
use crate::error::{Result, SpeakError};
use crate::session::{ProcessKind, SessionRegistry};

/// Header carrying the streamable-HTTP session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// A bidirectional JSON-RPC channel to one tool provider.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response (or `timeout`).
    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration)
        -> Result<Value>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Shut the channel down. Subprocesses get `grace` to exit before being killed.
    async fn close(&self, grace: Duration);

    fn is_connected(&self) -> bool;

    /// OS process id for subprocess transports.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Open a transport for the configured provider.
///
/// Stdio subprocesses are tracked in `registry` (as provider processes) for
/// as long as they run.
pub async fn connect(
    name: &str,
    cfg: &McpServerConfig,
    registry: Option<&SessionRegistry>,
) -> Result<Box<dyn McpTransport>> {
    match cfg.transport {
        McpTransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(name, cfg, registry)?)),
        McpTransportKind::Websocket => {
            let url = require_url(name, cfg)?;
            Ok(Box::new(WebSocketTransport::connect(name, url).await?))
        }
        McpTransportKind::StreamableHttp => {
            let url = require_url(name, cfg)?;
            Ok(Box::new(HttpTransport::new(name, url, &cfg.headers)?))
        }
    }
}

fn require_url<'a>(name: &str, cfg: &'a McpServerConfig) -> Result<&'a str> {
    cfg.url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            SpeakError::Config(format!(
                "provider '{}' uses {} transport but has no url",
                name, cfg.transport
            ))
        })
}

// ============================================================================
// Response routing
// ============================================================================

#[derive(Default)]
struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
}

impl PendingRequests {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value>>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);
        rx
    }

    fn cancel(&self, id: u64) {
        self.waiters().remove(&id);
    }

    fn resolve(&self, id: u64, msg: JsonRpcMessage) -> bool {
        match self.waiters().remove(&id) {
            Some(tx) => {
                let _ = tx.send(msg.into_result());
                true
            }
            None => false,
        }
    }

    fn fail_all(&self, reason: &str) {
        for (_, tx) in self.waiters().drain() {
            let _ = tx.send(Err(SpeakError::Transport(reason.to_string())));
        }
    }
}

/// Handle one inbound frame. Returns a reply to send back, if any.
fn dispatch(provider: &str, raw: &str, pending: &PendingRequests) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let msg: JsonRpcMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(_) => {
            debug!(provider = %provider, line = %crate::utils::string::preview(raw, 200), "Ignoring non JSON-RPC output");
            return None;
        }
    };
    if msg.is_server_request() {
        debug!(provider = %provider, method = ?msg.method, "Server-initiated request");
        return Some(server_request_reply(&msg));
    }
    match msg.response_id() {
        Some(id) => {
            if !pending.resolve(id, msg) {
                debug!(provider = %provider, id, "Response for unknown or expired request");
            }
        }
        None => debug!(provider = %provider, method = ?msg.method, "Notification from provider"),
    }
    None
}

async fn await_response(
    pending: &PendingRequests,
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    method: &str,
    timeout: Duration,
) -> Result<Value> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(SpeakError::Transport(format!(
            "connection closed while waiting for {}",
            method
        ))),
        Err(_) => {
            pending.cancel(id);
            Err(SpeakError::Timeout(format!(
                "{} timed out after {}ms",
                method,
                timeout.as_millis()
            )))
        }
    }
}

// ============================================================================
// Stdio
// ============================================================================

type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

async fn write_line(stdin: &SharedStdin, line: &str) -> Result<()> {
    let mut guard = stdin.lock().await;
    let pipe = guard
        .as_mut()
        .ok_or_else(|| SpeakError::Transport("provider stdin is closed".into()))?;
    pipe.write_all(line.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await?;
    Ok(())
}

/// Provider launched as a subprocess speaking newline-delimited JSON-RPC.
pub struct StdioTransport {
    name: String,
    stdin: SharedStdin,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    exited: CancellationToken,
    kill: CancellationToken,
    pid: Option<u32>,
}

impl StdioTransport {
    pub fn spawn(
        name: &str,
        cfg: &McpServerConfig,
        registry: Option<&SessionRegistry>,
    ) -> Result<Self> {
        let command = cfg
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                SpeakError::Config(format!("provider '{}' has no command configured", name))
            })?;

        let mut cmd = Command::new(command);
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SpeakError::Transport(format!(
                "Failed to spawn provider '{}' ({}): {}",
                name, command, e
            ))
        })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpeakError::Transport(format!("provider '{}' has no stdout", name)))?;
        let stderr = child.stderr.take();
        let stdin: SharedStdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));

        let pending = Arc::new(PendingRequests::default());
        let connected = Arc::new(AtomicBool::new(true));
        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        let guard =
            registry.map(|r| r.track_process(None, ProcessKind::Provider, name, pid, kill.clone()));

        info!(provider = %name, command = %command, pid = ?pid, "Provider process spawned");

        // stdout: route responses, answer server requests
        {
            let name = name.to_string();
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(reply) = dispatch(&name, &line, &pending) {
                                if let Err(e) = write_line(&stdin, &reply.to_string()).await {
                                    debug!(provider = %name, error = %e, "Failed to answer server request");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(provider = %name, error = %e, "Provider stdout read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.fail_all(&format!("provider '{}' closed its output", name));
            });
        }

        if let Some(stderr) = stderr {
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %name, "stderr: {}", line);
                }
            });
        }

        // Owns the child: waits for exit or force-kills on request.
        {
            let name = name.to_string();
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let exited = exited.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            warn!(provider = %name, error = %e, "Failed to kill provider process");
                        }
                        child.wait().await
                    }
                };
                info!(provider = %name, status = ?status.ok(), "Provider process exited");
                drop(guard);
                connected.store(false, Ordering::SeqCst);
                pending.fail_all(&format!("provider '{}' process exited", name));
                exited.cancel();
            });
        }

        Ok(Self {
            name: name.to_string(),
            stdin,
            pending,
            connected,
            exited,
            kill,
            pid,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id);
        let frame = serde_json::to_string(&JsonRpcRequest::request(id, method, params))?;
        if let Err(e) = write_line(&self.stdin, &frame).await {
            self.pending.cancel(id);
            return Err(e);
        }
        await_response(&self.pending, id, rx, method, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        write_line(&self.stdin, &frame).await
    }

    async fn close(&self, grace: Duration) {
        // Closing stdin asks the server to exit on its own; SIGTERM follows.
        self.stdin.lock().await.take();
        if !self.exited.is_cancelled() {
            if let Some(pid) = self.pid {
                terminate(&self.name, pid);
            }
        }
        if tokio::time::timeout(grace, self.exited.cancelled())
            .await
            .is_err()
        {
            warn!(
                provider = %self.name,
                grace_ms = grace.as_millis() as u64,
                "Provider did not exit within grace window, killing"
            );
            self.kill.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(2), self.exited.cancelled()).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Ask a provider process to shut down.
#[cfg(unix)]
fn terminate(name: &str, pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: plain signal delivery to a child we spawned; no memory is shared.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        debug!(provider = %name, pid, "Sent SIGTERM to provider");
    } else {
        debug!(
            provider = %name,
            pid,
            error = %std::io::Error::last_os_error(),
            "SIGTERM delivery failed"
        );
    }
}

#[cfg(not(unix))]
fn terminate(_name: &str, _pid: u32) {}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

// ============================================================================
// WebSocket
// ============================================================================

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Provider reached over a WebSocket, one JSON-RPC frame per text message.
pub struct WebSocketTransport {
    name: String,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    pub async fn connect(name: &str, url: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SpeakError::WebSocket(format!("invalid url {}: {}", url, e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", WsHeaderValue::from_static("mcp"));

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SpeakError::WebSocket(format!("connection to {} failed: {}", url, e)))?;
        let (sink, mut source) = stream.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let pending = Arc::new(PendingRequests::default());
        let connected = Arc::new(AtomicBool::new(true));

        info!(provider = %name, url = %url, "WebSocket provider connected");

        let reader = {
            let name = name.to_string();
            let sink = Arc::clone(&sink);
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if let Some(reply) = dispatch(&name, text.as_str(), &pending) {
                                let mut sink = sink.lock().await;
                                if let Err(e) = sink.send(WsMessage::text(reply.to_string())).await {
                                    debug!(provider = %name, error = %e, "Failed to answer server request");
                                }
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(provider = %name, error = %e, "WebSocket read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.fail_all(&format!("provider '{}' connection closed", name));
            })
        };

        Ok(Self {
            name: name.to_string(),
            sink,
            pending,
            connected,
            reader,
        })
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(WsMessage::text(frame))
            .await
            .map_err(|e| SpeakError::WebSocket(format!("connection error: {}", e)))
    }
}

#[async_trait]
impl McpTransport for WebSocketTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id);
        let frame = serde_json::to_string(&JsonRpcRequest::request(id, method, params))?;
        if let Err(e) = self.send_frame(frame).await {
            self.pending.cancel(id);
            return Err(e);
        }
        await_response(&self.pending, id, rx, method, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.send_frame(frame).await
    }

    async fn close(&self, grace: Duration) {
        let closed = tokio::time::timeout(grace, async {
            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Close(None)).await
        })
        .await;
        if !matches!(closed, Ok(Ok(()))) {
            debug!(provider = %self.name, "WebSocket close handshake incomplete");
        }
        self.reader.abort();
        self.connected.store(false, Ordering::SeqCst);
        self.pending
            .fail_all(&format!("provider '{}' connection closed", self.name));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Streamable HTTP
// ============================================================================

/// Provider reached over streamable HTTP.
pub struct HttpTransport {
    name: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(name: &str, url: &str, extra_headers: &HashMap<String, String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in extra_headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SpeakError::Config(format!("invalid header name {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SpeakError::Config(format!("invalid header value for {}: {}", key, e)))?;
            headers.insert(header, value);
        }
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client: reqwest::Client::new(),
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        }
    }

    async fn post(&self, body: &JsonRpcRequest, timeout: Duration) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_ID_HEADER, session);
        }
        let response = req.send().await.map_err(|e| map_http_error(&self.name, e))?;
        self.remember_session(&response);

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SpeakError::Transport(format!(
                "provider '{}' returned HTTP {}: {}",
                self.name,
                status.as_u16(),
                crate::utils::string::preview(&text, 300)
            )));
        }
        Ok(response)
    }
}

fn map_http_error(provider: &str, err: reqwest::Error) -> SpeakError {
    if err.is_timeout() {
        SpeakError::Timeout(format!("provider '{}' request timeout: {}", provider, err))
    } else {
        SpeakError::Transport(format!("provider '{}' connection error: {}", provider, err))
    }
}

/// Find the response to request `id` in an SSE body.
pub fn parse_sse_response(body: &str, id: u64) -> Result<Value> {
    for event in body.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if data.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<JsonRpcMessage>(&data.join("\n")) else {
            continue;
        };
        if msg.response_id() == Some(id) {
            return msg.into_result();
        }
    }
    Err(SpeakError::Mcp(format!(
        "no response for request {} in event stream",
        id
    )))
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let body = JsonRpcRequest::request(id, method, params);
        let response = self.post(&body, timeout).await?;

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|e| map_http_error(&self.name, e))?;

        if is_sse {
            parse_sse_response(&text, id)
        } else {
            serde_json::from_str::<JsonRpcMessage>(&text)?.into_result()
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = JsonRpcRequest::notification(method, params);
        self.post(&body, Duration::from_secs(10)).await?;
        Ok(())
    }

    async fn close(&self, grace: Duration) {
        if let Some(session) = self.session_id() {
            let result = self
                .client
                .delete(&self.url)
                .timeout(grace)
                .headers(self.headers.clone())
                .header(SESSION_ID_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                debug!(provider = %self.name, error = %e, "Session termination request failed");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sse_response_picks_matching_id() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n";
        assert_eq!(parse_sse_response(body, 2).unwrap(), json!({"tools": []}));
        assert!(parse_sse_response(body, 3).is_err());
    }

    #[test]
    fn test_dispatch_resolves_pending() {
        let pending = PendingRequests::default();
        let id = pending.next_id();
        let mut rx = pending.register(id);
        let reply = dispatch(
            "p",
            &format!(r#"{{"jsonrpc":"2.0","id":{},"result":{{"x":1}}}}"#, id),
            &pending,
        );
        assert!(reply.is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_dispatch_ignores_noise_and_answers_ping() {
        let pending = PendingRequests::default();
        assert!(dispatch("p", "starting server...", &pending).is_none());
        let reply = dispatch("p", r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#, &pending).unwrap();
        assert_eq!(reply["id"], json!(5));
    }

    #[test]
    fn test_fail_all_errors_waiters() {
        let pending = PendingRequests::default();
        let mut rx = pending.register(pending.next_id());
        pending.fail_all("gone");
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let cfg = McpServerConfig::stdio("speakmcp-definitely-missing-binary", &[]);
        let err = StdioTransport::spawn("ghost", &cfg, None).err().unwrap();
        assert!(err.to_string().contains("Failed to spawn"), "err was: {}", err);
    }

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let cfg = McpServerConfig {
            transport: McpTransportKind::StreamableHttp,
            ..Default::default()
        };
        let err = connect("web", &cfg, None).await.err().unwrap();
        assert!(matches!(err, SpeakError::Config(_)));
    }

    // `cat` echoes every frame back: our ping request returns as a server
    // request, we answer it, and the echoed answer resolves the request.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_roundtrip_and_close_with_cat() {
        let registry = SessionRegistry::new();
        let cfg = McpServerConfig::stdio("cat", &[]);
        let transport = StdioTransport::spawn("echo", &cfg, Some(&registry)).unwrap();
        assert!(transport.pid().is_some());
        assert_eq!(registry.process_count(ProcessKind::Provider), 1);

        let result = transport
            .request("ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!({}));

        transport.close(Duration::from_secs(2)).await;
        assert!(!transport.is_connected());
        assert_eq!(registry.process_count(ProcessKind::Provider), 0);
    }

    // A provider that ignores stdin EOF still gets TERM before the kill.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_sends_sigterm_before_kill() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("terminated");
        let script = format!(
            "trap 'echo term > {}; exit 0' TERM; exec 0<&-; while true; do sleep 0.05; done",
            marker.display()
        );
        let cfg = McpServerConfig::stdio("sh", &["-c", &script]);
        let transport = StdioTransport::spawn("stubborn", &cfg, None).unwrap();
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        transport.close(Duration::from_millis(800)).await;
        assert!(!transport.is_connected());
        assert!(marker.exists(), "provider was killed without a TERM");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_kill_via_registry() {
        let registry = SessionRegistry::new();
        let cfg = McpServerConfig::stdio("sleep", &["30"]);
        let transport = StdioTransport::spawn("sleeper", &cfg, Some(&registry)).unwrap();

        registry.emergency_stop_all();
        tokio::time::timeout(Duration::from_secs(5), transport.exited.cancelled())
            .await
            .unwrap();
        assert!(!transport.is_connected());
    }
}
