//! Configuration validation with unknown field detection.

use serde_json::Value;
use std::collections::HashSet;

use super::{Config, McpTransportKind};

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &["agent", "context", "mcp", "provider", "logging"];

/// Known fields for each section.
const KNOWN_AGENT: &[&str] = &[
    "model",
    "max_iterations",
    "timeout_secs",
    "verify_completion",
    "noop_streak_limit",
    "tool_retry_attempts",
    "tool_retry_base_ms",
    "summary_min_chars",
    "max_tokens",
    "temperature",
    "system_prompt",
];

const KNOWN_CONTEXT: &[&str] = &[
    "enabled",
    "target_ratio",
    "default_context_window",
    "model_limits",
    "system_prompt_max_chars",
    "tool_result_threshold_chars",
    "keep_recent_exchanges",
    "critical_keep_exchanges",
    "summarize_with_llm",
];

const KNOWN_MCP: &[&str] = &[
    "servers",
    "runtime_disabled_servers",
    "disabled_tools",
    "connect_timeout_ms",
    "shutdown_grace_ms",
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn new(level: DiagnosticLevel, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut row = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        prev = row;
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn check_keys(
    obj: &serde_json::Map<String, Value>,
    prefix: &str,
    known: &[&str],
    out: &mut Vec<Diagnostic>,
) -> bool {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    let mut has_unknown = false;
    for key in obj.keys() {
        if known_set.contains(key.as_str()) {
            continue;
        }
        has_unknown = true;
        let msg = match suggest_field(key, known) {
            Some(suggestion) => format!("Unknown field '{}' ({})", key, suggestion),
            None => format!("Unknown field '{}'", key),
        };
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        out.push(Diagnostic::new(DiagnosticLevel::Error, path, msg));
    }
    has_unknown
}

/// Validate a raw JSON config value against known field names.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic::new(
                DiagnosticLevel::Error,
                "",
                "Config must be a JSON object",
            ));
            return diagnostics;
        }
    };

    diagnostics.push(Diagnostic::new(DiagnosticLevel::Ok, "", "Valid JSON"));

    let mut has_unknown = check_keys(obj, "", KNOWN_TOP_LEVEL, &mut diagnostics);
    for (section, known) in [
        ("agent", KNOWN_AGENT),
        ("context", KNOWN_CONTEXT),
        ("mcp", KNOWN_MCP),
    ] {
        if let Some(inner) = obj.get(section).and_then(|v| v.as_object()) {
            has_unknown |= check_keys(inner, section, known, &mut diagnostics);
        }
    }

    if !has_unknown {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Ok,
            "",
            "All fields recognized",
        ));
    }

    diagnostics
}

/// Semantic checks on a parsed config: ranges and per-provider transport requirements.
pub fn validate_semantics(config: &Config) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let ratio = config.context.target_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "context.target_ratio",
            format!("{} is outside (0, 1]", ratio),
        ));
    } else if !(0.6..=0.7).contains(&ratio) {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Warn,
            "context.target_ratio",
            format!("{} is outside the recommended 0.6-0.7 range", ratio),
        ));
    }

    if config.agent.max_iterations == 0 {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "agent.max_iterations",
            "must be at least 1",
        ));
    }

    for (name, server) in &config.mcp.servers {
        let path = format!("mcp.servers.{}", name);
        if name.contains(':') {
            diagnostics.push(Diagnostic::new(
                DiagnosticLevel::Error,
                path.clone(),
                "provider names must not contain ':'",
            ));
        }
        match server.transport {
            McpTransportKind::Stdio => {
                if server.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticLevel::Error,
                        path,
                        "stdio transport requires 'command'",
                    ));
                }
            }
            McpTransportKind::Websocket | McpTransportKind::StreamableHttp => {
                let url = server.url.as_deref().unwrap_or("");
                let scheme_ok = if server.transport == McpTransportKind::Websocket {
                    url.starts_with("ws://") || url.starts_with("wss://")
                } else {
                    url.starts_with("http://") || url.starts_with("https://")
                };
                if !scheme_ok {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticLevel::Error,
                        path,
                        format!("{} transport requires a matching 'url'", server.transport),
                    ));
                }
            }
        }
    }

    for name in &config.mcp.runtime_disabled_servers {
        if !config.mcp.servers.contains_key(name) {
            diagnostics.push(Diagnostic::new(
                DiagnosticLevel::Warn,
                "mcp.runtime_disabled_servers",
                format!("'{}' is not a configured provider", name),
            ));
        }
    }

    diagnostics
}
