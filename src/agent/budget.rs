//! Context budget manager.
//!
//! Keeps the prompt under a fraction of the active model's context window.
//! The window is resolved from the provider's model catalog, then a static
//! per-model table, then the configured default. Reduction runs in tiers,
//! each applied only while the estimate is still over target:
//!
//! 1. [`CompressionTier::SystemPrompt`]: strip schema boilerplate and cap
//!    the system message.
//! 2. [`CompressionTier::ToolResults`]: summarize oversized tool results.
//! 3. [`CompressionTier::MiddleSummary`]: fold the middle of the
//!    conversation into one summary message.
//! 4. [`CompressionTier::CriticalOnly`]: keep system, keyword-critical and
//!    most recent messages only.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Role};
use crate::utils::string::truncate_with_marker;

use super::compaction::{
    build_summary_prompt, build_tool_result_prompt, compact_system_prompt, digest_tool_result,
    fallback_summary, filter_critical, middle_messages, summarize_middle,
};
use super::context_monitor::ContextMonitor;

/// Known context windows, matched by longest model-id prefix.
const MODEL_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gpt-5", 400_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4", 200_000),
    ("claude", 200_000),
    ("gemini", 1_000_000),
    ("llama-3", 128_000),
    ("mixtral", 32_768),
    ("mistral", 32_000),
    ("deepseek", 64_000),
    ("qwen", 32_768),
];

/// Cap on a deterministic middle summary.
const FALLBACK_SUMMARY_MAX_CHARS: usize = 4_000;

/// Max tokens requested for LLM-generated summaries.
const SUMMARY_MAX_TOKENS: u32 = 1_024;

/// One reduction step of the budget pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTier {
    SystemPrompt,
    ToolResults,
    MiddleSummary,
    CriticalOnly,
}

impl fmt::Display for CompressionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SystemPrompt => "system_prompt",
            Self::ToolResults => "tool_results",
            Self::MiddleSummary => "middle_summary",
            Self::CriticalOnly => "critical_only",
        };
        f.write_str(name)
    }
}

/// Result of shaping a prompt.
#[derive(Debug, Clone)]
pub struct BudgetOutcome {
    pub messages: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub target_tokens: usize,
    /// Tiers that ran, in order. Empty when the input already fit.
    pub tiers_applied: Vec<CompressionTier>,
}

impl BudgetOutcome {
    pub fn was_reduced(&self) -> bool {
        !self.tiers_applied.is_empty()
    }

    pub fn within_budget(&self) -> bool {
        self.tokens_after <= self.target_tokens
    }
}

/// Completion capability used for LLM-generated summaries.
#[derive(Clone, Copy)]
pub struct Summarizer<'a> {
    pub provider: &'a dyn LLMProvider,
    pub model: &'a str,
}

impl<'a> Summarizer<'a> {
    pub fn new(provider: &'a dyn LLMProvider, model: &'a str) -> Self {
        Self { provider, model }
    }

    async fn summarize(&self, prompt: String) -> Option<String> {
        let options = ChatOptions::new()
            .with_max_tokens(SUMMARY_MAX_TOKENS)
            .with_temperature(0.0);
        match self
            .provider
            .chat(vec![Message::user(&prompt)], Some(self.model), options)
            .await
        {
            Ok(response) if !response.content.trim().is_empty() => {
                Some(response.content.trim().to_string())
            }
            Ok(_) => {
                warn!(model = self.model, "Summary request returned empty content");
                None
            }
            Err(e) => {
                warn!(model = self.model, error = %e, "Summary request failed");
                None
            }
        }
    }
}

/// Context budget manager.
#[derive(Debug, Clone, Default)]
pub struct ContextBudget {
    config: ContextConfig,
}

impl ContextBudget {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Context window from configuration overrides or the built-in table.
    ///
    /// Configured overrides match when the model id contains the key; the
    /// built-in table matches by longest prefix after stripping any
    /// `vendor/` routing prefix.
    ///
    /// ```
    /// use speakmcp_core::agent::ContextBudget;
    /// use speakmcp_core::config::ContextConfig;
    ///
    /// let budget = ContextBudget::new(ContextConfig::default());
    /// assert_eq!(budget.static_limit("gpt-4o-mini"), Some(128_000));
    /// assert_eq!(budget.static_limit("openai/gpt-4"), Some(8_192));
    /// assert_eq!(budget.static_limit("my-local-model"), None);
    /// ```
    pub fn static_limit(&self, model: &str) -> Option<usize> {
        let model = model.to_lowercase();

        let configured = self
            .config
            .model_limits
            .iter()
            .filter(|(key, _)| model.contains(&key.to_lowercase()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, limit)| *limit);
        if configured.is_some() {
            return configured;
        }

        let bare = model.rsplit('/').next().unwrap_or(&model);
        MODEL_CONTEXT_WINDOWS
            .iter()
            .filter(|(prefix, _)| bare.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limit)| *limit)
    }

    /// Resolve the model's context window: provider catalog, then the
    /// static table, then the configured default.
    pub async fn resolve_context_window(
        &self,
        provider: Option<&dyn LLMProvider>,
        model: &str,
    ) -> usize {
        if let Some(provider) = provider {
            if let Some(window) = provider.context_window(model).await {
                debug!(model, window, "Context window from provider catalog");
                return window;
            }
        }
        self.static_limit(model)
            .unwrap_or(self.config.default_context_window)
    }

    /// Token target for `model`.
    pub async fn target_tokens(&self, provider: Option<&dyn LLMProvider>, model: &str) -> usize {
        let window = self.resolve_context_window(provider, model).await;
        ContextMonitor::new(window, self.config.target_ratio).target_tokens()
    }

    /// Shape `messages` for a completion call to `model` on `provider`.
    pub async fn manage_context(
        &self,
        messages: Vec<Message>,
        provider: &dyn LLMProvider,
        model: &str,
    ) -> BudgetOutcome {
        let target = self.target_tokens(Some(provider), model).await;
        let summarizer = self
            .config
            .summarize_with_llm
            .then(|| Summarizer::new(provider, model));
        self.manage_context_with_target(messages, target, summarizer)
            .await
    }

    /// Shape `messages` to fit `target_tokens`.
    ///
    /// Without a summarizer every tier is deterministic. The system message
    /// and the most recent exchange are always kept.
    pub async fn manage_context_with_target(
        &self,
        messages: Vec<Message>,
        target_tokens: usize,
        summarizer: Option<Summarizer<'_>>,
    ) -> BudgetOutcome {
        let tokens_before = ContextMonitor::estimate_tokens(&messages);
        let mut outcome = BudgetOutcome {
            messages,
            tokens_before,
            tokens_after: tokens_before,
            target_tokens,
            tiers_applied: Vec::new(),
        };
        if !self.config.enabled || tokens_before <= target_tokens {
            return outcome;
        }

        const TIERS: [CompressionTier; 4] = [
            CompressionTier::SystemPrompt,
            CompressionTier::ToolResults,
            CompressionTier::MiddleSummary,
            CompressionTier::CriticalOnly,
        ];
        for tier in TIERS {
            if outcome.tokens_after <= target_tokens {
                break;
            }
            let messages = std::mem::take(&mut outcome.messages);
            outcome.messages = match tier {
                CompressionTier::SystemPrompt => self.compact_system(messages),
                CompressionTier::ToolResults => self.shrink_tool_results(messages, summarizer).await,
                CompressionTier::MiddleSummary => self.summarize_history(messages, summarizer).await,
                CompressionTier::CriticalOnly => {
                    filter_critical(messages, self.config.critical_keep_exchanges)
                }
            };
            let before = outcome.tokens_after;
            outcome.tokens_after = ContextMonitor::estimate_tokens(&outcome.messages);
            outcome.tiers_applied.push(tier);
            info!(
                tier = %tier,
                tokens_before = before,
                tokens_after = outcome.tokens_after,
                target_tokens,
                "Context reduced"
            );
        }

        if outcome.tokens_after > target_tokens {
            warn!(
                tokens_after = outcome.tokens_after,
                target_tokens, "Context still over budget after all tiers"
            );
        }
        outcome
    }

    fn compact_system(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for msg in messages.iter_mut().filter(|m| m.role == Role::System) {
            msg.content = compact_system_prompt(&msg.content, self.config.system_prompt_max_chars);
        }
        messages
    }

    async fn shrink_tool_results(
        &self,
        mut messages: Vec<Message>,
        summarizer: Option<Summarizer<'_>>,
    ) -> Vec<Message> {
        let threshold = self.config.tool_result_threshold_chars;
        for msg in messages.iter_mut().filter(|m| m.role == Role::Tool) {
            if msg.content.chars().count() <= threshold {
                continue;
            }
            let summary = match summarizer {
                Some(s) => s.summarize(build_tool_result_prompt(&msg.content, threshold)).await,
                None => None,
            };
            msg.content = match summary {
                Some(text) => truncate_with_marker(&format!("[summarized]\n{}", text), threshold),
                None => digest_tool_result(&msg.content, threshold),
            };
        }
        messages
    }

    async fn summarize_history(
        &self,
        messages: Vec<Message>,
        summarizer: Option<Summarizer<'_>>,
    ) -> Vec<Message> {
        let keep = self.config.keep_recent_exchanges;
        let middle = middle_messages(&messages, keep);
        if middle.is_empty() {
            return messages;
        }
        let summary = match summarizer {
            Some(s) => s.summarize(build_summary_prompt(middle)).await,
            None => None,
        };
        let summary = summary.unwrap_or_else(|| {
            truncate_with_marker(&fallback_summary(middle), FALLBACK_SUMMARY_MAX_CHARS)
        });
        summarize_middle(messages, keep, &summary)
    }
}
