//! Loop-level retry of transient tool failures.
//!
//! A tool result flagged as an error whose text looks transient (timeouts,
//! dropped connections, busy servers) is retried with exponential backoff
//! before being accepted as-is. Other errors go straight back to the model.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::{ToolCall, ToolResult};
use crate::tools::ToolExecutor;

static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(timeout|timed out|connection|network|busy|econnreset|econnrefused|etimedout|temporarily unavailable|try again)",
    )
    .expect("valid transient error regex")
});

/// Whether a failed result looks worth retrying.
pub fn is_transient_tool_error(result: &ToolResult) -> bool {
    result.is_error && TRANSIENT_RE.is_match(&result.text())
}

/// Backoff before retry `attempt` (0-indexed): `base * 2^attempt`.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Execute `call`, retrying transient failures up to `max_retries` times.
///
/// Returns the final result and the number of retries performed. Stops
/// retrying as soon as `cancel` trips.
pub async fn execute_with_retry(
    executor: &dyn ToolExecutor,
    call: &ToolCall,
    cancel: &CancellationToken,
    max_retries: u32,
    base_delay: Duration,
) -> (ToolResult, u32) {
    let mut result = executor.execute(call, cancel).await;
    let mut retries = 0;
    while retries < max_retries && is_transient_tool_error(&result) {
        let delay = retry_delay(retries, base_delay);
        warn!(
            tool = %call.name,
            attempt = retries + 1,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            "Transient tool failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(tool = %call.name, "Retry abandoned: run cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        retries += 1;
        result = executor.execute(call, cancel).await;
    }
    (result, retries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        failures: u32,
        error: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolExecutor for Scripted {
        async fn execute(&self, _call: &ToolCall, _cancel: &CancellationToken) -> ToolResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ToolResult::error(self.error)
            } else {
                ToolResult::ok("fine")
            }
        }
    }

    fn call() -> ToolCall {
        ToolCall::new("1", "net:fetch", json!({}))
    }

    #[test]
    fn test_transient_detection() {
        assert!(is_transient_tool_error(&ToolResult::error("Request timed out")));
        assert!(is_transient_tool_error(&ToolResult::error("ECONNRESET by peer")));
        assert!(!is_transient_tool_error(&ToolResult::error("file not found")));
        assert!(!is_transient_tool_error(&ToolResult::ok("timeout value is 5")));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(0, base), Duration::from_secs(1));
        assert_eq!(retry_delay(1, base), Duration::from_secs(2));
        assert_eq!(retry_delay(2, base), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let exec = Scripted {
            failures: 5,
            error: "invalid path",
            calls: AtomicU32::new(0),
        };
        let (result, retries) = execute_with_retry(
            &exec,
            &call(),
            &CancellationToken::new(),
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_error);
        assert_eq!(retries, 0);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let exec = Scripted {
            failures: 10,
            error: "network unreachable",
            calls: AtomicU32::new(0),
        };
        let (result, retries) = execute_with_retry(
            &exec,
            &call(),
            &CancellationToken::new(),
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_error);
        assert_eq!(retries, 2);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_retrying() {
        let exec = Scripted {
            failures: 10,
            error: "timeout",
            calls: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, retries) =
            execute_with_retry(&exec, &call(), &cancel, 2, Duration::from_secs(60)).await;
        assert_eq!(retries, 0);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }
}
