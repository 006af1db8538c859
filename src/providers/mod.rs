//! Providers module - the completion capability
//!
//! This module defines the `LLMProvider` trait the agent loop calls, an
//! OpenAI-compatible implementation and a retry decorator.
//!
//! # Example
//!
//! ```rust,ignore
//! use speakmcp_core::providers::{ChatOptions, LLMProvider};
//! use speakmcp_core::providers::openai::OpenAIProvider;
//! use speakmcp_core::session::Message;
//!
//! async fn example() {
//!     let provider = OpenAIProvider::new("your-api-key");
//!     let messages = vec![Message::user("Hello!")];
//!     let options = ChatOptions::new().with_max_tokens(1000);
//!
//!     let response = provider.chat(messages, None, options).await.unwrap();
//!     println!("Response: {}", response.content);
//! }
//! ```

pub mod openai;
pub mod retry;
mod types;

use crate::config::Config;
use crate::error::{Result, SpeakError};

pub use openai::OpenAIProvider;
pub use retry::RetryProvider;
pub use types::{ChatOptions, LLMProvider, LLMResponse, Usage};

/// Build the configured completion provider, wrapped for retry when enabled.
pub fn build_provider(config: &Config) -> Result<Box<dyn LLMProvider>> {
    let api_key = config
        .provider
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            SpeakError::Config(
                "no API key configured (set provider.api_key or OPENAI_API_KEY)".into(),
            )
        })?;

    let mut provider = match config.provider.api_base.as_deref() {
        Some(base) => OpenAIProvider::with_base_url(api_key, base),
        None => OpenAIProvider::new(api_key),
    };
    provider = provider.with_model(&config.agent.model);

    if config.provider.retry.enabled {
        Ok(Box::new(RetryProvider::from_config(
            Box::new(provider),
            &config.provider.retry,
        )))
    } else {
        Ok(Box::new(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_provider_requires_key() {
        let mut config = Config::default();
        config.provider.api_key = None;
        assert!(build_provider(&config).is_err());
    }

    #[test]
    fn test_build_provider_uses_configured_model() {
        let mut config = Config::default();
        config.provider.api_key = Some("sk-test".into());
        config.agent.model = "local-model".into();
        let provider = build_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.default_model(), "local-model");
    }
}
