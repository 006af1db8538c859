//! Session module - conversation value types, the session registry and the
//! conversation store seam.
//!
//! # Example
//!
//! ```
//! use speakmcp_core::session::{SessionRegistry, SessionStatus};
//!
//! let registry = SessionRegistry::new();
//! let id = registry.create_session("conv_1", 10, None);
//! registry.set_status(&id, SessionStatus::Processing).unwrap();
//!
//! registry.stop_session(&id);
//! assert!(registry.should_stop(&id));
//! ```

pub mod registry;
pub mod store;
pub mod types;

pub use registry::{
    AgentSession, ProcessGuard, ProcessKind, ProgressKind, SessionRegistry, SessionStatus,
    StopReport,
};
pub use store::{ConversationStore, InMemoryConversationStore};
pub use types::{Conversation, Message, Role, ToolCall, ToolResult};
