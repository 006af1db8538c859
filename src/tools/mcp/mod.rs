//! MCP (Model Context Protocol) client support.
//!
//! - `protocol`: JSON-RPC 2.0 frames, MCP tool types, result normalization
//! - `transport`: stdio subprocess, WebSocket and streamable-HTTP channels
//! - `client`: handshake, paginated tool listing and tool calls

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::McpClient;
pub use protocol::{CallToolResult, McpTool};
pub use transport::McpTransport;
