//! SSE Transport
//!
//! For clients that keep a `GET /sse` stream open and POST their requests to
//! the endpoint announced in the first `endpoint` event. Replies are returned
//! in the POST response and also pushed onto every open stream, together with
//! server notifications.

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
use futures::{stream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 100;

/// Path announced in the `endpoint` event
pub const MESSAGES_PATH: &str = "/messages";

struct SseState<H> {
    handler: Arc<H>,
    event_tx: broadcast::Sender<String>,
}

/// SSE-only transport
pub struct SseTransport {
    bind_addr: String,
}

impl SseTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

/// Router of the SSE transport. Must be called inside the runtime: it starts
/// the task that copies server notifications onto the event stream.
pub fn sse_router<H: McpHandler + 'static>(handler: Arc<H>) -> Router {
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

    if let Some(mut notifications) = handler.notifications() {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(note) => {
                        if let Ok(data) = serde_json::to_string(&note) {
                            let _ = tx.send(data);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "SSE transport dropped notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let state = Arc::new(SseState { handler, event_tx });
    Router::new()
        .route("/", get(sse_handler::<H>))
        .route("/sse", get(sse_handler::<H>))
        .route(MESSAGES_PATH, post(message_handler::<H>))
        .route("/message", post(message_handler::<H>))
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
impl Transport for SseTransport {
    async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!(addr = %self.bind_addr, "Starting SSE transport");

        let app = sse_router(handler);
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "SSE transport listening");

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "transport": "sse"
    }))
}

async fn message_handler<H: McpHandler>(State(state): State<Arc<SseState<H>>>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "SSE message");
    match dispatch_payload(state.handler.as_ref(), &body).await {
        Some(reply) => {
            let _ = state.event_tx.send(reply.to_string());
            Json(reply).into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn sse_handler<H: McpHandler + 'static>(
    State(state): State<Arc<SseState<H>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("SSE client connected");

    let initial = stream::iter(vec![Ok(Event::default().event("endpoint").data(MESSAGES_PATH))]);

    let rx = state.event_tx.subscribe();
    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(data) => Some(Ok(Event::default().event("message").data(data))),
            Err(_) => None,
        }
    });

    Sse::new(initial.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
