//! SpeakMCP core - agent orchestration over MCP tool providers
//!
//! The crate runs a tool-calling agent loop against an OpenAI-compatible
//! completion endpoint, with tools hosted by external MCP providers. Each
//! conversation has its own message queue, every run is tracked in a session
//! registry that supports cooperative stop and emergency stop, and prompts
//! are kept inside the model's context window by a tiered budget manager.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod providers;
pub mod queue;
pub mod session;
pub mod tools;
pub mod utils;

pub use agent::{AgentLoop, AgentResult, RunContext, RunStatus};
pub use config::Config;
pub use engine::Engine;
pub use error::{Result, SpeakError};
pub use providers::{ChatOptions, LLMProvider, LLMResponse};
pub use queue::{MessageQueue, QueuedMessage, QueuedMessageStatus};
pub use session::{Message, Role, SessionRegistry, ToolCall, ToolResult};
pub use tools::{ToolDescriptor, ToolExecutor, ToolGateway};
