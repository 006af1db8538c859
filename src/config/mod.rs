//! Configuration management for SpeakMCP core
//!
//! This module provides configuration loading and saving. Configuration is
//! loaded from `~/.speakmcp/config.json` with environment variable overrides.
//! The core only reads it; instances are passed explicitly to the components
//! that need them.

mod types;
pub mod validate;

pub use types::*;

use crate::error::Result;
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the SpeakMCP configuration directory path (~/.speakmcp)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".speakmcp")
    }

    /// Returns the path to the config file (~/.speakmcp/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `SPEAKMCP_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SPEAKMCP_AGENT_MODEL") {
            self.agent.model = val;
        }
        if let Ok(val) = std::env::var("SPEAKMCP_AGENT_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.agent.max_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("SPEAKMCP_AGENT_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.agent.timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("SPEAKMCP_AGENT_VERIFY_COMPLETION") {
            if let Ok(v) = val.parse() {
                self.agent.verify_completion = v;
            }
        }
        if let Ok(val) = std::env::var("SPEAKMCP_CONTEXT_TARGET_RATIO") {
            if let Ok(v) = val.parse() {
                self.context.target_ratio = v;
            }
        }

        if let Ok(val) = std::env::var("SPEAKMCP_PROVIDER_API_KEY") {
            self.provider.api_key = Some(val);
        } else if self.provider.api_key.is_none() {
            if let Ok(val) = std::env::var("OPENAI_API_KEY") {
                self.provider.api_key = Some(val);
            }
        }
        if let Ok(val) = std::env::var("SPEAKMCP_PROVIDER_API_BASE") {
            self.provider.api_base = Some(val);
        }

        if let Ok(val) = std::env::var("SPEAKMCP_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Per-run wall-clock limit, `None` when unlimited.
    pub fn agent_timeout(&self) -> Option<std::time::Duration> {
        match self.agent.timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.noop_streak_limit, 2);
        assert_eq!(config.agent.tool_retry_attempts, 2);
        assert!(!config.agent.verify_completion);
        assert!((config.context.target_ratio - 0.65).abs() < f64::EPSILON);
        assert!(config.mcp.servers.is_empty());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.agent.max_iterations, 10);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.agent.max_iterations = 25;
        config
            .mcp
            .servers
            .insert("files".into(), McpServerConfig::stdio("npx", &["-y", "fs"]));
        config.mcp.runtime_disabled_servers.push("slow".into());
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.agent.max_iterations, 25);
        assert_eq!(loaded.mcp.servers["files"].args, vec!["-y", "fs"]);
        assert_eq!(loaded.mcp.runtime_disabled_servers, vec!["slow"]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"agent": {"max_iterations": 3}, "mcp": {"servers": {"web": {"transport": "streamableHttp", "url": "http://localhost:9000/mcp"}}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.agent.noop_streak_limit, 2);
        let web = &config.mcp.servers["web"];
        assert_eq!(web.transport, McpTransportKind::StreamableHttp);
        assert_eq!(web.url.as_deref(), Some("http://localhost:9000/mcp"));
        assert!(!web.disabled);
    }

    #[test]
    fn test_transport_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&McpTransportKind::StreamableHttp).unwrap(),
            "\"streamableHttp\""
        );
        assert_eq!(
            serde_json::to_string(&McpTransportKind::Websocket).unwrap(),
            "\"websocket\""
        );
        assert_eq!(McpTransportKind::Stdio.to_string(), "stdio");
    }

    #[test]
    fn test_agent_timeout_zero_is_unlimited() {
        let mut config = Config::default();
        config.agent.timeout_secs = 0;
        assert!(config.agent_timeout().is_none());
        config.agent.timeout_secs = 5;
        assert_eq!(
            config.agent_timeout(),
            Some(std::time::Duration::from_secs(5))
        );
    }
}
