//! Tools module - provider-hosted tools and their execution
//!
//! Tools are opaque capabilities hosted by external MCP providers. This
//! module connects to those providers, keeps a registry of what they expose
//! and executes calls on behalf of the agent loop.
//!
//! # Overview
//!
//! - `ToolDescriptor`: a registered tool, named `provider:tool`
//! - `ToolExecutor`: the seam the agent loop calls tools through
//! - `ToolRegistry`: name lookup with bare-name fallback
//! - `ToolEnablement`: runtime enable/disable and usage statistics
//! - `ToolGateway`: provider connections plus execution with automatic
//!   argument-name correction
//!
//! # Example
//!
//! ```rust
//! use speakmcp_core::config::McpConfig;
//! use speakmcp_core::tools::ToolGateway;
//!
//! # tokio_test::block_on(async {
//! let gateway = ToolGateway::new(McpConfig::default(), None);
//! let report = gateway.initialize().await;
//! assert!(report.connected.is_empty());
//! assert!(gateway.get_available_tools().is_empty());
//! # });
//! ```

pub mod enablement;
pub mod gateway;
pub mod mcp;
mod registry;
mod types;

pub use enablement::{ToolEnablement, ToolUsageStats};
pub use gateway::{
    InitReport, McpConnector, ProviderClient, ProviderConnector, ProviderStatus, ToolGateway,
};
pub use registry::ToolRegistry;
pub use types::{
    qualified_name, split_qualified_name, ToolDescriptor, ToolExecutor, TOOL_NAME_SEPARATOR,
};
