//! Error types for easy-mcp-server

use serde_json::Value;
use thiserror::Error;

use crate::framing::FrameError;
use crate::protocol::error_codes;

/// Main error type shared by the protocol engine and the bridge subsystem
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Error object returned by a JSON-RPC peer
    #[error("{message} (code {code})")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Bridge stopped: {0}")]
    BridgeStopped(String),

    #[error("Bridge exited: {0}")]
    BridgeExited(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a "bridge stopped" error
    pub fn stopped(msg: impl Into<String>) -> Self {
        Error::BridgeStopped(msg.into())
    }

    /// Create a "bridge exited" error
    pub fn exited(msg: impl Into<String>) -> Self {
        Error::BridgeExited(msg.into())
    }

    /// Create an HTTP transport error
    pub fn http(msg: impl Into<String>) -> Self {
        Error::Http(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// JSON-RPC error code a caller should see for this error
    pub fn rpc_code(&self) -> i32 {
        match self {
            Error::Rpc { code, .. } => *code,
            Error::Frame(_) => error_codes::PARSE_ERROR,
            Error::InvalidArgument(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_code_mapping() {
        let err = Error::Rpc {
            code: -32001,
            message: "custom".into(),
            data: None,
        };
        assert_eq!(err.rpc_code(), -32001);
        assert_eq!(Error::invalid_argument("x").rpc_code(), -32602);
        assert_eq!(Error::timeout("slow").rpc_code(), -32603);
        assert_eq!(
            Error::Frame(FrameError::MissingContentLength).rpc_code(),
            -32700
        );
    }

    #[test]
    fn test_display_keeps_reason() {
        let err = Error::stopped("bridge 'github' was stopped");
        assert!(err.to_string().contains("stopped"));
    }
}
