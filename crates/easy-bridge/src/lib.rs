//! easy-bridge: external MCP providers for easy-mcp-server
//!
//! A bridge is an MCP server that runs somewhere else, either as a child
//! process speaking framed JSON-RPC over stdio or as a remote HTTP endpoint.
//! Its tools are merged into the local catalog and calls are proxied to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   BridgeManager                      │
//! │   mcp-bridge.json ──► start / stop / restart (all)   │
//! │        ▲                                             │
//! │        └── ConfigWatcher (notify)                    │
//! │                                                      │
//! │   ┌──────────────────┐      ┌──────────────────┐     │
//! │   │   StdioBridge    │      │    HttpBridge    │     │
//! │   │ child process    │      │ POST /mcp or /   │     │
//! │   │ RpcConnection    │      │ GET /sse         │     │
//! │   └──────────────────┘      └──────────────────┘     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use easy_bridge::{BridgeManager, BridgeSettings};
//!
//! let manager = BridgeManager::new(BridgeSettings {
//!     config_path: Some("mcp-bridge.json".into()),
//!     ..Default::default()
//! });
//! for bridge in manager.live_bridges().await {
//!     let tools = bridge.call("tools/list", None, Duration::from_secs(10)).await?;
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod http;
pub mod manager;
pub mod sse;
pub mod stdio;
pub mod watcher;

// Re-exports
pub use client::{Bridge, BridgeKind, BridgeState, BridgeTimeouts};
pub use config::{resolve_config_path, BridgeConfig, BridgeServerConfig, BRIDGE_CONFIG_FILE};
pub use connection::RpcConnection;
pub use http::HttpBridge;
pub use manager::{BridgeEvent, BridgeManager, BridgeSettings, BridgeSource};
pub use stdio::StdioBridge;
pub use watcher::{watch_bridge_config, ConfigWatcher};
