//! Configuration type definitions for SpeakMCP core
//!
//! This module defines all configuration structs consumed by the orchestration
//! core. All types implement serde traits for JSON serialization and have
//! sensible defaults, so a partial (or missing) config file is always valid.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Main configuration struct for SpeakMCP core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent loop settings (model, iterations, timeout, verification)
    pub agent: AgentDefaults,
    /// Context budget settings
    pub context: ContextConfig,
    /// MCP tool provider configuration
    pub mcp: McpConfig,
    /// Completion provider (OpenAI-compatible endpoint) settings
    pub provider: ProviderConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Agent Configuration
// ============================================================================

/// Default agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Default model to use
    pub model: String,
    /// Maximum loop iterations per run
    pub max_iterations: u32,
    /// Maximum wall-clock time (seconds) for a single agent run. 0 = unlimited.
    pub timeout_secs: u64,
    /// Run a conservative verifier before accepting a "done" decision.
    pub verify_completion: bool,
    /// Consecutive no-op decisions tolerated before a nudge is injected.
    pub noop_streak_limit: u32,
    /// Additional attempts for tool calls failing with a transient error.
    pub tool_retry_attempts: u32,
    /// Base delay for tool retry backoff, in milliseconds (`base * 2^attempt`).
    pub tool_retry_base_ms: u64,
    /// Completions carrying tool calls with less narrative than this get a summary pass.
    pub summary_min_chars: usize,
    /// Maximum tokens for responses
    pub max_tokens: u32,
    /// Temperature for generation
    pub temperature: f32,
    /// Replaces the built-in system prompt preamble when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_iterations: 10,
            timeout_secs: 600,
            verify_completion: false,
            noop_streak_limit: 2,
            tool_retry_attempts: 2,
            tool_retry_base_ms: 1_000,
            summary_min_chars: 50,
            max_tokens: 4096,
            temperature: 0.2,
            system_prompt: None,
        }
    }
}

// ============================================================================
// Context Budget Configuration
// ============================================================================

/// Context budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Whether prompt shaping is applied before each completion call.
    pub enabled: bool,
    /// Fraction of the model's context window used as the target budget.
    pub target_ratio: f64,
    /// Context window assumed when neither the catalog nor the table knows the model.
    pub default_context_window: usize,
    /// Per-model context window overrides (model id substring → tokens).
    pub model_limits: BTreeMap<String, usize>,
    /// Absolute cap on the system message length after boilerplate stripping.
    pub system_prompt_max_chars: usize,
    /// Tool results longer than this are summarized or truncated.
    pub tool_result_threshold_chars: usize,
    /// Exchanges kept verbatim when the middle of the conversation is summarized.
    pub keep_recent_exchanges: usize,
    /// Exchanges kept in the last-resort critical-only reduction.
    pub critical_keep_exchanges: usize,
    /// Ask the completion provider for summaries (falls back to digests on failure).
    pub summarize_with_llm: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_ratio: 0.65,
            default_context_window: 32_000,
            model_limits: BTreeMap::new(),
            system_prompt_max_chars: 12_000,
            tool_result_threshold_chars: 8_000,
            keep_recent_exchanges: 3,
            critical_keep_exchanges: 2,
            summarize_with_llm: true,
        }
    }
}

// ============================================================================
// MCP Configuration
// ============================================================================

/// MCP (Model Context Protocol) tool provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Tool provider definitions keyed by provider name.
    pub servers: BTreeMap<String, McpServerConfig>,
    /// Providers the user switched off at runtime (persisted across restarts).
    pub runtime_disabled_servers: Vec<String>,
    /// Fully-qualified tool names disabled by the user.
    pub disabled_tools: Vec<String>,
    /// Connect + list-tools deadline per provider, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Grace window between graceful and forced termination of provider processes.
    pub shutdown_grace_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            runtime_disabled_servers: Vec::new(),
            disabled_tools: Vec::new(),
            connect_timeout_ms: 10_000,
            shutdown_grace_ms: 3_000,
        }
    }
}

/// How the gateway talks to a tool provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum McpTransportKind {
    /// Local subprocess speaking newline-delimited JSON-RPC on stdin/stdout.
    #[default]
    Stdio,
    /// Remote endpoint over a WebSocket connection.
    Websocket,
    /// Remote endpoint over streamable HTTP (POST + JSON or SSE responses).
    StreamableHttp,
}

impl std::fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Websocket => write!(f, "websocket"),
            Self::StreamableHttp => write!(f, "streamableHttp"),
        }
    }
}

/// Configuration for a single tool provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    /// Transport used to reach the provider.
    pub transport: McpTransportKind,
    /// Executable for `stdio` providers.
    pub command: Option<String>,
    /// Arguments for `stdio` providers.
    pub args: Vec<String>,
    /// Extra environment for `stdio` providers.
    pub env: HashMap<String, String>,
    /// Endpoint for `websocket` and `streamableHttp` providers.
    pub url: Option<String>,
    /// Extra HTTP headers for `streamableHttp` providers.
    pub headers: HashMap<String, String>,
    /// Per-request timeout in milliseconds. `None` uses the gateway default.
    pub timeout_ms: Option<u64>,
    /// Disabled in configuration; never started.
    pub disabled: bool,
}

impl McpServerConfig {
    /// Stdio provider launched with `command args...`.
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        Self {
            transport: McpTransportKind::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Remote provider reached over `transport` at `url`.
    pub fn remote(transport: McpTransportKind, url: &str) -> Self {
        Self {
            transport,
            url: Some(url.to_string()),
            ..Default::default()
        }
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// OpenAI-compatible completion endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key for authentication
    pub api_key: Option<String>,
    /// Custom API base URL (defaults to the OpenAI endpoint)
    pub api_base: Option<String>,
    /// Retry behavior for transient completion failures
    pub retry: RetryConfig,
}

/// Retry behavior for completion calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable automatic retry for transient provider errors.
    pub enabled: bool,
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// Compact single-line output; pair with `log_component!`.
    #[default]
    Component,
    /// JSON lines for log aggregators.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Optional log file (JSON format only)
    pub file: Option<String>,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            file: None,
            level: "info".to_string(),
        }
    }
}
