//! Agent module - the orchestrator and its collaborators
//!
//! This module provides the decide → act → observe loop and the pieces it is
//! built from:
//!
//! - [`AgentLoop`]: drives one run against a completion provider and a tool
//!   executor, under cancellation, deadline and iteration limits
//! - [`decision`]: parses the model's JSON decision into a tagged union
//! - [`ContextBudget`]: keeps each prompt under the model's token budget
//! - [`progress`]: structured progress updates for an observer
//! - [`tool_retry`] and [`verify`]: transient tool retry and completion checks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │ ContextBudget│<───│  AgentLoop  │────>│ LLMProvider  │
//! └─────────────┘     │             │     └──────────────┘
//!                     │             │────>┌──────────────┐
//!                     └─────────────┘     │ ToolExecutor │
//!                            │            │  (gateway)   │
//!                            ▼            └──────────────┘
//!                     ┌─────────────┐
//!                     │  Progress   │
//!                     │  Observer   │
//!                     └─────────────┘
//! ```

pub mod budget;
pub mod compaction;
pub mod context_monitor;
pub mod decision;
mod r#loop;
pub mod progress;
pub mod prompt;
pub mod tool_retry;
pub mod verify;

pub use budget::{BudgetOutcome, CompressionTier, ContextBudget, Summarizer};
pub use context_monitor::ContextMonitor;
pub use decision::{parse_decision, Decision};
pub use progress::{AgentProgress, ChannelObserver, ProgressObserver, ProgressStep, StepKind, StepStatus};
pub use r#loop::{
    AgentLoop, AgentResult, RunContext, RunStatus, ITERATION_LIMIT_MARKER, STOPPED_MESSAGE,
};
pub use verify::VerificationVerdict;
