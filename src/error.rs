//! Error types for SpeakMCP core
//!
//! This module defines all error types used throughout the orchestration core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Most failures inside an agent run are *recoverable* and never reach the
//! caller as an `Err`: tool failures become tool-result content, malformed
//! decisions fall back to plain text, and iteration/timeout ceilings produce a
//! best-effort answer. The variants below cover what remains.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Structured classification of completion-capability failures.
///
/// Lets retry decisions be made without string matching.
#[derive(Debug)]
pub enum ProviderError {
    /// 401: Invalid API key or authentication failure
    Auth(String),
    /// 429: Rate limit or quota exceeded
    RateLimit(String),
    /// 500/502/503/504: Server-side errors
    ServerError(String),
    /// 400: Bad request, invalid JSON, malformed parameters
    InvalidRequest(String),
    /// 404: Model not found or endpoint not available
    ModelNotFound(String),
    /// Connection or read timeout
    Timeout(String),
    /// Provider is overloaded: retry with backoff
    Overloaded(String),
    /// Catch-all for unrecognized errors
    Unknown(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ProviderError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            ProviderError::ServerError(msg) => write!(f, "Server error: {}", msg),
            ProviderError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ProviderError::ModelNotFound(msg) => write!(f, "Model not found: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ProviderError::Overloaded(msg) => write!(f, "Overloaded error: {}", msg),
            ProviderError::Unknown(msg) => write!(f, "Unknown provider error: {}", msg),
        }
    }
}

impl ProviderError {
    /// Classify an HTTP status code and body into a `ProviderError`.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = body.to_string();
        match status {
            401 | 403 => ProviderError::Auth(body),
            429 => ProviderError::RateLimit(body),
            400 | 422 => ProviderError::InvalidRequest(body),
            404 => ProviderError::ModelNotFound(body),
            529 => ProviderError::Overloaded(body),
            500..=599 => ProviderError::ServerError(body),
            _ => ProviderError::Unknown(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Returns `true` if this error is transient and the request should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_)
                | ProviderError::ServerError(_)
                | ProviderError::Timeout(_)
                | ProviderError::Overloaded(_)
        )
    }
}

impl From<ProviderError> for SpeakError {
    fn from(err: ProviderError) -> Self {
        SpeakError::ProviderTyped(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for SpeakMCP core operations.
#[derive(Error, Debug)]
pub enum SpeakError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Untyped completion-capability errors.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Structured completion-capability error with classification for retry decisions.
    #[error("Provider error: {0}")]
    ProviderTyped(ProviderError),

    /// Tool provider connect/timeout failures. Logged and isolated per provider.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Tool execution errors that could not be expressed as a tool result.
    #[error("Tool error: {0}")]
    Tool(String),

    /// MCP protocol errors (JSON-RPC error objects, malformed frames).
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Session registry errors (unknown session, invalid transition).
    #[error("Session error: {0}")]
    Session(String),

    /// Message queue errors (unknown conversation or message).
    #[error("Queue error: {0}")]
    Queue(String),

    /// The operation was cancelled by an explicit stop or abort.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Resource not found (sessions, tools, providers, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl SpeakError {
    /// Returns `true` when this error came from cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpeakError::Cancelled(_))
    }
}

/// A specialized `Result` type for SpeakMCP core operations.
pub type Result<T> = std::result::Result<T, SpeakError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpeakError::Config("missing API key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing API key");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SpeakError = io_err.into();
        assert!(matches!(err, SpeakError::Io(_)));
    }

    #[test]
    fn test_error_variants() {
        let _ = SpeakError::Config("test".into());
        let _ = SpeakError::Provider("test".into());
        let _ = SpeakError::ProviderTyped(ProviderError::Auth("test".into()));
        let _ = SpeakError::Transport("test".into());
        let _ = SpeakError::Tool("test".into());
        let _ = SpeakError::Mcp("test".into());
        let _ = SpeakError::Session("test".into());
        let _ = SpeakError::Queue("test".into());
        let _ = SpeakError::Cancelled("test".into());
        let _ = SpeakError::Timeout("test".into());
        let _ = SpeakError::NotFound("test".into());
        let _ = SpeakError::WebSocket("test".into());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(SpeakError::Cancelled("stop".into()).is_cancelled());
        assert!(!SpeakError::Timeout("slow".into()).is_cancelled());
    }

    #[test]
    fn test_provider_error_is_retryable() {
        assert!(ProviderError::RateLimit("429".into()).is_retryable());
        assert!(ProviderError::ServerError("500".into()).is_retryable());
        assert!(ProviderError::Timeout("timeout".into()).is_retryable());
        assert!(ProviderError::Overloaded("busy".into()).is_retryable());

        assert!(!ProviderError::Auth("401".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("400".into()).is_retryable());
        assert!(!ProviderError::ModelNotFound("404".into()).is_retryable());
        assert!(!ProviderError::Unknown("???".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_from_status() {
        assert!(matches!(
            ProviderError::from_status(401, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "down"),
            ProviderError::ServerError(_)
        ));
        assert!(matches!(
            ProviderError::from_status(529, "busy"),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            ProviderError::from_status(418, "teapot"),
            ProviderError::Unknown(_)
        ));
    }

    #[test]
    fn test_provider_typed_display() {
        let err = SpeakError::ProviderTyped(ProviderError::Auth("invalid key".into()));
        assert_eq!(
            err.to_string(),
            "Provider error: Authentication error: invalid key"
        );
    }
}
