//! Core types and utilities for easy-mcp-server
//!
//! # Modules
//!
//! - `config`: Environment file loading and server settings
//! - `error`: Error types and Result alias
//! - `framing`: Content-Length / newline-delimited message codec
//! - `protocol`: JSON-RPC 2.0 envelope types
//! - `route`: Interface to locally implemented API routes

pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod route;

// Re-exports
pub use config::{load_environment, Settings};
pub use error::{Error, Result};
pub use framing::{encode_frame, write_frame, Dialect, FrameDecoder, FrameError};
pub use protocol::{
    error_codes, JsonRpcError, McpNotification, McpRequest, McpResponse, PROTOCOL_VERSION,
};
pub use route::{
    handler_fn, ParameterLocation, ParameterSpec, RouteDescriptor, RouteHandler, RouteMetadata,
    RouteRequest, RouteResponse,
};
