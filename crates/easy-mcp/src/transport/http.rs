//! HTTP Transport
//!
//! `POST /mcp` is the standard endpoint, `POST /` the compatibility endpoint
//! some clients use, and `GET /sse` streams server notifications. CORS is
//! permissive on every route.

use super::{dispatch_payload, McpHandler, Transport};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state for HTTP handlers
struct HttpState<H> {
    handler: Arc<H>,
}

/// HTTP transport (JSON-RPC over POST, notifications over SSE)
pub struct HttpTransport {
    bind_addr: String,
}

impl HttpTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

/// Router of the HTTP transport, usable without binding a socket
pub fn http_router<H: McpHandler + 'static>(handler: Arc<H>) -> Router {
    let state = Arc::new(HttpState { handler });

    Router::new()
        .route("/", get(root_handler).post(mcp_handler::<H>))
        .route("/mcp", post(mcp_handler::<H>))
        .route("/sse", get(sse_handler::<H>))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!(addr = %self.bind_addr, "Starting HTTP transport");

        let app = http_router(handler);
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP transport listening");

        axum::serve(listener, app).await?;
        Ok(())
    }
}

// === Handlers ===

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": crate::SERVER_NAME,
        "version": crate::SERVER_VERSION,
        "protocol": crate::PROTOCOL_VERSION,
        "endpoints": {
            "mcp": "POST /mcp",
            "compat": "POST /",
            "sse": "GET /sse",
            "health": "GET /health"
        }
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": crate::SERVER_NAME,
        "version": crate::SERVER_VERSION
    }))
}

async fn mcp_handler<H: McpHandler>(State(state): State<Arc<HttpState<H>>>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "HTTP MCP request");
    match dispatch_payload(state.handler.as_ref(), &body).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn sse_handler<H: McpHandler + 'static>(
    State(state): State<Arc<HttpState<H>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("SSE client connected");

    let endpoint = futures::stream::once(async { Ok(Event::default().event("endpoint").data("/mcp")) });

    let notifications = match state.handler.notifications() {
        Some(rx) => BroadcastStream::new(rx)
            .filter_map(|result| async move {
                let note = result.ok()?;
                let data = serde_json::to_string(&note).ok()?;
                Some(Ok(Event::default().event("message").data(data)))
            })
            .boxed(),
        None => futures::stream::pending().boxed(),
    };

    Sse::new(endpoint.chain(notifications)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
