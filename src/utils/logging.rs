//! Logging initialization for SpeakMCP core.
//!
//! Supports three formats:
//! - `pretty`: multi-line human-readable output
//! - `component`: `[timestamp] [LEVEL] target message {fields}`, compact and grep-friendly;
//!   use the [`log_component!`] macro to add a `component` field for per-subsystem filtering
//! - `json`: structured JSON lines for log aggregators
//!
//! All formats write to stderr (or the configured file) so that stdout stays
//! clean for CLI output such as `speakmcp tools --json`.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, SpeakError};

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
/// Falls back to `RUST_LOG` env var; if unset, uses `cfg.level`.
/// Installing a second subscriber is a no-op rather than an error.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let installed = match cfg.format {
        LogFormat::Json => {
            if let Some(path) = &cfg.file {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .try_init()
            } else {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .try_init()
            }
        }
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        // Component-tagged events come from `log_component!`, which adds a
        // structured `component` field to the compact formatter.
        LogFormat::Component => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init(),
    };

    if let Err(e) = installed {
        // Already installed (tests, embedding hosts). Anything else is a config problem.
        let msg = e.to_string();
        if !msg.contains("already") {
            return Err(SpeakError::Config(format!("logging: {}", msg)));
        }
    }
    Ok(())
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`).
/// The `component` field makes it easy to grep logs by subsystem:
///
/// ```
/// # use speakmcp_core::log_component;
/// log_component!(info, "gateway", "provider connected");
/// log_component!(warn, "budget", "context over target", tokens = 9000u64, target = 8000u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.format, LogFormat::Component);
        assert_eq!(cfg.level, "info");
        assert!(cfg.file.is_none());
    }

    #[test]
    fn test_log_format_deserialize() {
        let cfg: LoggingConfig =
            serde_json::from_str(r#"{"format":"json","level":"debug"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");

        let cfg: LoggingConfig = serde_json::from_str(r#"{"format":"pretty"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn test_init_logging_twice_is_ok() {
        let cfg = LoggingConfig::default();
        assert!(init_logging(&cfg).is_ok());
        assert!(init_logging(&cfg).is_ok());
    }

    #[test]
    fn test_log_component_macro_compiles() {
        log_component!(debug, "test", "plain");
        log_component!(info, "test", "with fields", a = 1u32, b = "x");
    }
}
