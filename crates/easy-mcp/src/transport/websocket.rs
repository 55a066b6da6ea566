//! WebSocket Transport
//!
//! Full-duplex transport speaking either plain JSON-RPC or the provider
//! envelope used by some clients:
//!
//! ```text
//! → {"type": "call_tool", "id": 7, "name": "get_users", "arguments": {}}
//! ← {"type": "call_tool_response", "id": 7, "content": [...], "isError": false}
//! → {"type": "ping", "id": 8}
//! ← {"type": "pong", "id": 8}
//! ```
//!
//! Messages carrying `jsonrpc` pass through untranslated. Server
//! notifications are pushed as `{"type": "notification", "method", "params"}`.

use super::{dispatch_value, McpHandler, Transport};
use crate::{JsonRpcError, McpResponse};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

const OUTBOUND_CAPACITY: usize = 64;

/// WebSocket transport
pub struct WebSocketTransport {
    bind_addr: String,
}

impl WebSocketTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

struct WsState<H> {
    handler: Arc<H>,
}

/// Router of the WebSocket transport
pub fn ws_router<H: McpHandler + 'static>(handler: Arc<H>) -> Router {
    let state = Arc::new(WsState { handler });

    Router::new()
        .route("/", get(ws_handler::<H>))
        .route("/ws", get(ws_handler::<H>))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!(addr = %self.bind_addr, "Starting WebSocket transport");

        let app = ws_router(handler);
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "WebSocket transport listening");

        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// A decoded inbound WebSocket message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Plain JSON-RPC message or batch, answered untranslated
    JsonRpc(Value),
    /// Provider envelope rewritten as a JSON-RPC request
    Envelope {
        kind: String,
        id: Option<Value>,
        request: Value,
    },
    /// Answered directly without dispatch (pong, malformed envelopes)
    Reply(Value),
}

fn envelope_method(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "initialize" => "initialize",
        "list_tools" => "tools/list",
        "call_tool" => "tools/call",
        "list_prompts" => "prompts/list",
        "get_prompt" => "prompts/get",
        "list_resources" => "resources/list",
        "read_resource" => "resources/read",
        _ => return None,
    })
}

fn envelope_error(id: Option<&Value>, error: JsonRpcError) -> Value {
    let mut reply = json!({ "type": "error", "error": error });
    if let Some(id) = id {
        reply["id"] = id.clone();
    }
    reply
}

/// Translate an inbound message. `request_id` is used as the JSON-RPC id of
/// translated envelopes so the reply can be matched even when the client
/// sent no id.
pub fn translate_inbound(message: Value, request_id: &str) -> Inbound {
    let Some(obj) = message.as_object() else {
        return Inbound::JsonRpc(message);
    };
    if obj.contains_key("jsonrpc") {
        return Inbound::JsonRpc(message);
    }

    let id = obj.get("id").cloned();
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return Inbound::Reply(envelope_error(
            id.as_ref(),
            JsonRpcError::invalid_request("Missing message type"),
        ));
    };

    if kind == "ping" {
        let mut pong = json!({ "type": "pong" });
        if let Some(id) = id {
            pong["id"] = id;
        }
        return Inbound::Reply(pong);
    }

    let Some(method) = envelope_method(kind) else {
        return Inbound::Reply(envelope_error(
            id.as_ref(),
            JsonRpcError::method_not_found(kind).with_data(json!({ "type": kind })),
        ));
    };

    let params = match kind {
        "call_tool" | "get_prompt" => {
            let mut params = Map::new();
            params.insert("name".into(), obj.get("name").cloned().unwrap_or(Value::Null));
            params.insert(
                "arguments".into(),
                obj.get("arguments").cloned().unwrap_or_else(|| json!({})),
            );
            Value::Object(params)
        }
        "read_resource" => {
            let mut params = Map::new();
            params.insert("uri".into(), obj.get("uri").cloned().unwrap_or(Value::Null));
            if let Some(args) = obj.get("arguments") {
                params.insert("arguments".into(), args.clone());
            }
            Value::Object(params)
        }
        _ => obj.get("params").cloned().unwrap_or_else(|| json!({})),
    };

    Inbound::Envelope {
        kind: kind.to_string(),
        id,
        request: json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        }),
    }
}

/// Translate a JSON-RPC reply back into the provider envelope
pub fn translate_outbound(kind: &str, id: Option<&Value>, response: &Value) -> Value {
    if let Some(error) = response.get("error") {
        let mut reply = json!({ "type": "error", "error": error });
        if let Some(id) = id {
            reply["id"] = id.clone();
        }
        return reply;
    }

    let mut reply = Map::new();
    reply.insert("type".into(), Value::String(format!("{}_response", kind)));
    if let Some(id) = id {
        reply.insert("id".into(), id.clone());
    }
    match response.get("result") {
        Some(Value::Object(result)) => {
            for (key, value) in result {
                if key != "type" && key != "id" {
                    reply.insert(key.clone(), value.clone());
                }
            }
        }
        Some(other) => {
            reply.insert("result".into(), other.clone());
        }
        None => {}
    }
    Value::Object(reply)
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "transport": "websocket"
    }))
}

async fn ws_handler<H: McpHandler + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState<H>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection<H: McpHandler + 'static>(socket: WebSocket, state: Arc<WsState<H>>) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    // Single writer; request tasks and the notification pump feed it
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = sender.send(message).await {
                error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    let welcome = json!({
        "type": "welcome",
        "server": crate::SERVER_NAME,
        "version": crate::SERVER_VERSION,
        "protocol": crate::PROTOCOL_VERSION
    });
    if out_tx.send(Message::Text(welcome.to_string())).await.is_err() {
        return;
    }

    let pump = state.handler.notifications().map(|mut notifications| {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(note) => {
                        let message = json!({
                            "type": "notification",
                            "method": note.method,
                            "params": note.params,
                        });
                        if out_tx.send(Message::Text(message.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client missed notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut next_id: u64 = 0;
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(request = %text, "WebSocket request");
                next_id += 1;
                let request_id = format!("ws-{}", next_id);
                let handler = state.handler.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handle_text(handler.as_ref(), &text, &request_id).await {
                        let _ = out_tx.send(Message::Text(reply.to_string())).await;
                    }
                });
            }
            Ok(Message::Ping(data)) => {
                if out_tx.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Ok(_) => {} // Ignore binary, pong, etc.
            Err(e) => {
                error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    if let Some(pump) = pump {
        pump.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    info!("WebSocket connection closed");
}

/// Reply to one text frame, if any
async fn handle_text<H: McpHandler + ?Sized>(handler: &H, text: &str, request_id: &str) -> Option<Value> {
    let message = match serde_json::from_str::<Value>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Invalid WebSocket message");
            return Some(
                McpResponse::error(Value::Null, JsonRpcError::parse_error(e.to_string())).to_value(),
            );
        }
    };

    match translate_inbound(message, request_id) {
        Inbound::JsonRpc(message) => dispatch_value(handler, message).await,
        Inbound::Reply(reply) => Some(reply),
        Inbound::Envelope { kind, id, request } => {
            let response = dispatch_value(handler, request).await?;
            Some(translate_outbound(&kind, id.as_ref(), &response))
        }
    }
}
