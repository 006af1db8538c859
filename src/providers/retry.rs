//! Retry provider - decorator that adds automatic retry with exponential backoff.
//!
//! Wraps any [`LLMProvider`] to transparently retry transient completion
//! errors such as HTTP 429 (rate limit), 5xx (server errors), timeouts and
//! provider overload.
//!
//! # Example
//!
//! ```rust,ignore
//! use speakmcp_core::providers::retry::RetryProvider;
//! use speakmcp_core::providers::openai::OpenAIProvider;
//!
//! let inner = OpenAIProvider::new("api-key");
//! let provider = RetryProvider::new(Box::new(inner))
//!     .with_max_retries(5)
//!     .with_base_delay_ms(500);
//! ```

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, SpeakError};
use crate::session::Message;

use super::{ChatOptions, LLMProvider, LLMResponse};

/// Patterns in untyped error messages that indicate a transient failure.
const RETRYABLE_PATTERNS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "rate limit",
    "rate_limit",
    "overloaded",
    "too many requests",
    "server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

/// A decorator provider that retries transient errors with exponential backoff.
///
/// Non-transient errors (bad request, auth, unknown model) and cancellation
/// are returned immediately.
pub struct RetryProvider {
    inner: Box<dyn LLMProvider>,
    /// Maximum number of retry attempts before giving up. Default: 3.
    max_retries: u32,
    /// Base delay in milliseconds for exponential backoff. Default: 1000.
    base_delay_ms: u64,
    /// Maximum delay cap in milliseconds. Default: 30000.
    max_delay_ms: u64,
}

impl std::fmt::Debug for RetryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProvider")
            .field("inner", &self.inner.name())
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .finish()
    }
}

impl RetryProvider {
    pub fn new(inner: Box<dyn LLMProvider>) -> Self {
        Self {
            inner,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }

    /// Build from the `provider.retry` config section.
    pub fn from_config(inner: Box<dyn LLMProvider>, cfg: &RetryConfig) -> Self {
        Self::new(inner)
            .with_max_retries(cfg.max_retries)
            .with_base_delay_ms(cfg.base_delay_ms)
            .with_max_delay_ms(cfg.max_delay_ms)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The delay for attempt `n` is `min(base_delay_ms * 2^n + jitter, max_delay_ms)`.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// Whether a completion error is transient.
///
/// Typed provider errors decide for themselves; untyped ones fall back to
/// substring matching.
pub fn is_retryable(err: &SpeakError) -> bool {
    match err {
        SpeakError::ProviderTyped(pe) => pe.is_retryable(),
        SpeakError::Timeout(_) => true,
        SpeakError::Cancelled(_) => false,
        SpeakError::Provider(_) | SpeakError::Http(_) => {
            let msg = err.to_string().to_lowercase();
            if ["400", "401", "403", "404"].iter().any(|p| msg.contains(p)) {
                return false;
            }
            RETRYABLE_PATTERNS.iter().any(|p| msg.contains(p))
        }
        _ => false,
    }
}

/// Compute the backoff delay for a given attempt (0-indexed).
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Sleep for the backoff delay of `attempt`.
///
/// Jitter comes from the sub-second part of the system clock.
pub async fn delay_with_jitter(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) {
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % base_delay_ms.max(1))
        .unwrap_or(0);
    let delay = compute_delay(attempt, base_delay_ms, max_delay_ms, jitter_ms);
    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
}

#[async_trait]
impl LLMProvider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn context_window(&self, model: &str) -> Option<usize> {
        self.inner.context_window(model).await
    }

    async fn chat(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .chat(messages.clone(), model, options.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %err,
                        "Retrying chat request after transient error"
                    );
                    delay_with_jitter(attempt, self.base_delay_ms, self.max_delay_ms).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails with the given error `failures` times, then succeeds.
    struct FlakyProvider {
        failures: u32,
        calls: Arc<AtomicU32>,
        make_error: fn() -> SpeakError,
    }

    #[async_trait]
    impl LLMProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn default_model(&self) -> &str {
            "model"
        }

        async fn chat(
            &self,
            _messages: Vec<Message>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.make_error)())
            } else {
                Ok(LLMResponse::text("ok"))
            }
        }
    }

    fn flaky(failures: u32, make_error: fn() -> SpeakError) -> (RetryProvider, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = FlakyProvider {
            failures,
            calls: Arc::clone(&calls),
            make_error,
        };
        let provider = RetryProvider::new(Box::new(inner))
            .with_base_delay_ms(1)
            .with_max_delay_ms(5);
        (provider, calls)
    }

    #[test]
    fn test_is_retryable_typed() {
        assert!(is_retryable(&ProviderError::RateLimit("slow down".into()).into()));
        assert!(is_retryable(&ProviderError::ServerError("boom".into()).into()));
        assert!(!is_retryable(&ProviderError::Auth("bad key".into()).into()));
        assert!(!is_retryable(&ProviderError::InvalidRequest("bad".into()).into()));
    }

    #[test]
    fn test_is_retryable_untyped() {
        assert!(is_retryable(&SpeakError::Provider("HTTP 503 Service Unavailable".into())));
        assert!(is_retryable(&SpeakError::Provider("model is overloaded".into())));
        assert!(!is_retryable(&SpeakError::Provider("HTTP 401 Unauthorized".into())));
        assert!(!is_retryable(&SpeakError::Provider("connection reset".into())));
        assert!(!is_retryable(&SpeakError::Cancelled("stop".into())));
        assert!(!is_retryable(&SpeakError::Config("no key".into())));
    }

    #[test]
    fn test_delay_calculation() {
        assert_eq!(compute_delay(0, 1000, 30_000, 0), 1000);
        assert_eq!(compute_delay(2, 1000, 30_000, 0), 4000);
        assert_eq!(compute_delay(1, 1000, 30_000, 200), 2200);
        assert_eq!(compute_delay(10, 1000, 30_000, 5000), 30_000);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (provider, calls) = flaky(2, || ProviderError::RateLimit("429".into()).into());
        let response = provider
            .chat(vec![], None, ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (provider, calls) = flaky(10, || ProviderError::ServerError("500".into()).into());
        let provider = provider.with_max_retries(2);
        assert!(provider
            .chat(vec![], None, ChatOptions::default())
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let (provider, calls) = flaky(1, || ProviderError::Auth("401".into()).into());
        assert!(provider
            .chat(vec![], None, ChatOptions::default())
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
