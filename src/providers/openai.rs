//! OpenAI-compatible Provider Implementation
//!
//! Implements the `LLMProvider` trait for the Chat Completions API spoken by
//! OpenAI and most hosted or local gateways (OpenRouter, Groq, vLLM, Ollama).
//! Tool calls and results travel as plain text, so the conversion flattens
//! them into assistant/user turns.
//!
//! # Example
//!
//! ```rust,ignore
//! use speakmcp_core::providers::{openai::OpenAIProvider, ChatOptions, LLMProvider};
//! use speakmcp_core::session::Message;
//!
//! async fn example() {
//!     let provider = OpenAIProvider::new("your-api-key");
//!     let messages = vec![
//!         Message::system("You are a helpful assistant."),
//!         Message::user("Hello!"),
//!     ];
//!     let response = provider
//!         .chat(messages, None, ChatOptions::default())
//!         .await
//!         .unwrap();
//!     println!("OpenAI: {}", response.content);
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result, SpeakError};
use crate::session::{Message, Role};

use super::{ChatOptions, LLMProvider, LLMResponse, Usage};

/// The OpenAI API endpoint URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// The default model to use.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

// ============================================================================
// API Request Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    /// "system", "user" or "assistant"
    role: &'static str,
    content: String,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(default)]
    r#type: Option<String>,
}

/// `GET /models` listing. Only gateways that publish context sizes are useful.
#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default, alias = "context_window", alias = "max_context_length")]
    context_length: Option<usize>,
}

// ============================================================================
// OpenAI Provider
// ============================================================================

/// OpenAI-compatible completion provider.
pub struct OpenAIProvider {
    api_key: String,
    api_base: String,
    client: Client,
    model: String,
    /// Context lengths from the model catalog, fetched once.
    catalog: tokio::sync::Mutex<Option<HashMap<String, usize>>>,
}

impl OpenAIProvider {
    /// Create a provider for the default OpenAI endpoint.
    ///
    /// # Example
    /// ```
    /// use speakmcp_core::providers::openai::OpenAIProvider;
    /// use speakmcp_core::providers::LLMProvider;
    ///
    /// let provider = OpenAIProvider::new("sk-xxx");
    /// assert_eq!(provider.name(), "openai");
    /// ```
    pub fn new(api_key: &str) -> Self {
        Self::with_client(api_key, OPENAI_API_URL, Client::new())
    }

    /// Create a provider for any OpenAI-compatible base URL (trailing slash removed).
    pub fn with_base_url(api_key: &str, api_base: &str) -> Self {
        Self::with_client(api_key, api_base, Client::new())
    }

    pub fn with_client(api_key: &str, api_base: &str, client: Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
            model: DEFAULT_MODEL.to_string(),
            catalog: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the default model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    async fn fetch_catalog(&self) -> Result<HashMap<String, usize>> {
        let response = self
            .client
            .get(format!("{}/models", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body).into());
        }
        let list: ModelList = response.json().await?;
        Ok(list
            .data
            .into_iter()
            .filter_map(|m| m.context_length.map(|len| (m.id, len)))
            .collect())
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Flatten conversation messages into Chat Completions turns.
///
/// Planned tool calls are appended to the assistant text as a `toolCalls`
/// JSON object; tool results become user turns.
fn convert_messages(messages: Vec<Message>) -> Vec<OpenAIMessage> {
    messages
        .into_iter()
        .map(|msg| match msg.role {
            Role::System => OpenAIMessage {
                role: "system",
                content: msg.content,
            },
            Role::User => OpenAIMessage {
                role: "user",
                content: msg.content,
            },
            Role::Assistant => {
                let content = match msg.tool_calls.filter(|calls| !calls.is_empty()) {
                    Some(calls) => {
                        let planned = json!({
                            "toolCalls": calls
                                .iter()
                                .map(|c| json!({"name": c.name, "arguments": c.arguments}))
                                .collect::<Vec<_>>()
                        });
                        if msg.content.trim().is_empty() {
                            planned.to_string()
                        } else {
                            format!("{}\n{}", msg.content, planned)
                        }
                    }
                    None => msg.content,
                };
                OpenAIMessage {
                    role: "assistant",
                    content,
                }
            }
            Role::Tool => OpenAIMessage {
                role: "user",
                content: msg.content,
            },
        })
        .collect()
}

fn convert_response(response: OpenAIResponse) -> LLMResponse {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    let mut llm_response = LLMResponse::text(&content);
    if let Some(usage) = response.usage {
        llm_response =
            llm_response.with_usage(Usage::new(usage.prompt_tokens, usage.completion_tokens));
    }
    llm_response
}

fn request_error(e: reqwest::Error) -> SpeakError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string()).into()
    } else if e.is_connect() {
        ProviderError::ServerError(format!("connection failed: {}", e)).into()
    } else {
        SpeakError::Provider(format!("OpenAI request failed: {}", e))
    }
}

// ============================================================================
// LLMProvider Implementation
// ============================================================================

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let model = model.unwrap_or(self.model.as_str());
        let request = OpenAIRequest {
            model: model.to_string(),
            messages: convert_messages(messages),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: options
                .json_mode
                .then(|| json!({"type": "json_object"})),
        };

        debug!(model = %model, messages = request.messages.len(), "OpenAI request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<OpenAIErrorResponse>(&error_text) {
                Ok(parsed) => format!(
                    "{} - {}",
                    parsed.error.r#type.unwrap_or_else(|| "error".to_string()),
                    parsed.error.message
                ),
                Err(_) => error_text,
            };
            return Err(ProviderError::from_status(status, &detail).into());
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| SpeakError::Provider(format!("Failed to parse OpenAI response: {}", e)))?;

        let converted = convert_response(openai_response);
        info!(
            model = %model,
            tokens = converted.usage.as_ref().map(|u| u.total_tokens),
            "OpenAI response received"
        );
        Ok(converted)
    }

    async fn context_window(&self, model: &str) -> Option<usize> {
        let mut catalog = self.catalog.lock().await;
        if catalog.is_none() {
            let fetched = match self.fetch_catalog().await {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "Model catalog unavailable, using static limits");
                    HashMap::new()
                }
            };
            *catalog = Some(fetched);
        }
        catalog.as_ref().and_then(|c| c.get(model).copied())
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// Tests
// ============================================================================
