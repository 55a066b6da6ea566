//! Transport Layer
//!
//! Provides the transport adapters:
//! - Stdio (length-prefixed frames on stdin/stdout)
//! - HTTP (`POST /mcp`, `POST /`, `GET /sse`)
//! - SSE (`GET /sse` + `POST /messages`)
//! - WebSocket (provider envelope or plain JSON-RPC)
//!
//! Every adapter hands raw payloads to [`dispatch_payload`], so envelope
//! validation and batch handling are identical across transports.

mod http;
mod sse;
mod stdio;
mod websocket;

pub use http::{http_router, HttpTransport};
pub use sse::{sse_router, SseTransport};
pub use stdio::{serve_io, StdioTransport};
pub use websocket::{translate_inbound, translate_outbound, ws_router, Inbound, WebSocketTransport};

use crate::{McpNotification, McpRequest, McpResponse, McpServer};
use anyhow::Result;
use easy_core::JsonRpcError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Generic MCP server trait for transport layer
#[async_trait::async_trait]
pub trait McpHandler: Send + Sync {
    async fn handle_request(&self, request: McpRequest) -> McpResponse;

    /// Server-initiated notifications, if the handler publishes any
    fn notifications(&self) -> Option<broadcast::Receiver<McpNotification>> {
        None
    }
}

/// Transport trait - implement for new transport types
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Serve requests using this transport
    async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()>;
}

#[async_trait::async_trait]
impl McpHandler for McpServer {
    async fn handle_request(&self, request: McpRequest) -> McpResponse {
        McpServer::handle_request(self, request).await
    }

    fn notifications(&self) -> Option<broadcast::Receiver<McpNotification>> {
        Some(self.subscribe())
    }
}

/// Decode and dispatch one raw payload.
///
/// Returns the serialized reply, or None when nothing must be sent back
/// (a notification, or a batch made only of notifications).
pub async fn dispatch_payload<H: McpHandler + ?Sized>(handler: &H, payload: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => dispatch_value(handler, value).await,
        Err(e) => {
            debug!(error = %e, "Unparseable payload");
            Some(McpResponse::error(Value::Null, JsonRpcError::parse_error(e.to_string())).to_value())
        }
    }
}

/// Dispatch an already decoded message or batch
pub async fn dispatch_value<H: McpHandler + ?Sized>(handler: &H, value: Value) -> Option<Value> {
    match value {
        Value::Array(batch) => {
            if batch.is_empty() {
                return Some(
                    McpResponse::error(Value::Null, JsonRpcError::invalid_request("Empty batch"))
                        .to_value(),
                );
            }
            let mut replies = Vec::new();
            for message in batch {
                if let Some(reply) = dispatch_single(handler, message).await {
                    replies.push(reply.to_value());
                }
            }
            (!replies.is_empty()).then_some(Value::Array(replies))
        }
        message => dispatch_single(handler, message).await.map(|r| r.to_value()),
    }
}

async fn dispatch_single<H: McpHandler + ?Sized>(handler: &H, message: Value) -> Option<McpResponse> {
    let request = match McpRequest::from_value(message) {
        Ok(request) => request,
        Err(invalid) => return Some(invalid),
    };

    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        let _ = handler.handle_request(request).await;
        return None;
    }
    Some(handler.handle_request(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl McpHandler for Echo {
        async fn handle_request(&self, request: McpRequest) -> McpResponse {
            McpResponse::success(request.id, json!({ "method": request.method }))
        }
    }

    #[tokio::test]
    async fn test_invalid_json_is_parse_error_with_null_id() {
        let reply = dispatch_payload(&Echo, b"{not json").await.unwrap();
        assert_eq!(reply["error"]["code"], -32700);
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_notification_gets_no_reply() {
        let reply = dispatch_payload(&Echo, br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_batch() {
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "1.0", "id": 3, "method": "ping"}
        ]);
        let reply = dispatch_value(&Echo, batch).await.unwrap();
        let replies = reply.as_array().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["result"]["method"], "ping");
        assert_eq!(replies[1]["error"]["code"], -32600);
        assert_eq!(replies[1]["id"], 3);

        let reply = dispatch_value(&Echo, json!([])).await.unwrap();
        assert_eq!(reply["error"]["code"], -32600);

        let only_notes = json!([{"jsonrpc": "2.0", "method": "a"}]);
        assert!(dispatch_value(&Echo, only_notes).await.is_none());
    }
}
