//! easy-mcp: MCP protocol engine
//!
//! Exposes local API routes, prompt templates and resource files to AI-model
//! clients over JSON-RPC, and merges in the tools of bridged MCP providers.
//!
//! Architecture:
//! transport (http | sse | websocket | stdio) → dispatch_payload → McpServer
//!     → ToolMerger (routes + bridges) | PromptStore | ResourceStore
//!
//! Methods:
//! - initialize, ping
//! - tools/list → local routes + live bridges, deduplicated
//! - tools/call → route handler or bridge `tools/call`
//! - prompts/list, prompts/get → prompt templates
//! - resources/list, resources/read → resource files

pub mod catalog;
pub mod content;
pub mod schema;
pub mod server;
pub mod transport;

pub use catalog::{tool_name_for, ToolCatalog, ToolDefinition, ToolMerger, ToolOrigin};
pub use content::{PromptStore, ResourceStore};
pub use easy_core::{JsonRpcError, McpNotification, McpRequest, McpResponse, PROTOCOL_VERSION};
pub use server::{McpServer, McpServerConfig};

pub const SERVER_NAME: &str = "easy-mcp-server";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for convenient imports
pub mod prelude {
    pub use super::transport::{McpHandler, Transport};
    pub use super::{McpRequest, McpResponse, McpServer, McpServerConfig};
}
