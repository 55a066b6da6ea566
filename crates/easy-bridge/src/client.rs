//! Common interface of bridge clients
//!
//! A bridge is one external MCP provider, reached either through a child
//! process ([`crate::stdio::StdioBridge`]) or over HTTP
//! ([`crate::http::HttpBridge`]).

use async_trait::async_trait;
use easy_core::{Result, PROTOCOL_VERSION};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Name reported as `clientInfo.name` during the handshake
pub const CLIENT_NAME: &str = "easy-mcp-server-bridge";

/// Transport of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    Process,
    Http,
}

/// Liveness of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Unstarted,
    Starting,
    Initialized,
    /// Start or handshake failed; the bridge is excluded from the catalog
    Failed,
    Stopped,
}

impl BridgeState {
    /// Whether the bridge can still take calls
    pub fn is_usable(self) -> bool {
        !matches!(self, BridgeState::Failed | BridgeState::Stopped)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Unstarted => "unstarted",
            BridgeState::Starting => "starting",
            BridgeState::Initialized => "initialized",
            BridgeState::Failed => "failed",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Timeouts applied by a bridge client
#[derive(Debug, Clone, Copy)]
pub struct BridgeTimeouts {
    /// Ceiling for the `initialize` handshake
    pub initialize: Duration,
    /// Default for calls that don't pass their own
    pub call: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(30),
            call: Duration::from_secs(10),
        }
    }
}

/// One external provider
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Provider name from the configuration file
    fn name(&self) -> &str;

    fn kind(&self) -> BridgeKind;

    fn state(&self) -> BridgeState;

    /// Spawn or connect. Does not perform the handshake.
    async fn start(&self) -> Result<()>;

    /// Send a request and wait for its result, starting and initializing the
    /// bridge first if needed
    async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value>;

    /// Stop the bridge, rejecting in-flight calls with a "stopped" error
    async fn stop(&self);

    /// Whether the underlying process or connection is still up
    fn is_alive(&self) -> bool;

    /// Notifications pushed by the provider
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

/// Params of the `initialize` request sent to providers
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_shape() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], "2024-11-05");
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn test_state_usability() {
        assert!(BridgeState::Unstarted.is_usable());
        assert!(BridgeState::Initialized.is_usable());
        assert!(!BridgeState::Failed.is_usable());
        assert!(!BridgeState::Stopped.is_usable());
        assert_eq!(BridgeState::Stopped.to_string(), "stopped");
    }
}
