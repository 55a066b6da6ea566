//! Remote bridge over HTTP
//!
//! Requests are POSTed as JSON-RPC envelopes. The endpoint is detected on
//! first use (`/mcp`, then the base URL itself) and remembered. Redirects are
//! followed by hand so the POST body is re-sent to the new location.

use crate::client::{initialize_params, Bridge, BridgeKind, BridgeState, BridgeTimeouts};
use crate::connection::{numeric_id, response_outcome, INITIALIZE_ID, NOTIFICATION_CAPACITY};
use crate::sse::{decode_sse_events, SseDecoder};
use async_trait::async_trait;
use easy_core::protocol::{McpNotification, McpRequest};
use easy_core::{Error, Result};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Session header issued by streamable-HTTP servers
pub const SESSION_HEADER: &str = "mcp-session-id";

const MAX_REDIRECTS: usize = 5;
const SSE_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const POST_ACCEPT: &str = "application/json, text/event-stream";

/// Bridge to a remote MCP server
pub struct HttpBridge {
    inner: Arc<Inner>,
    next_id: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    sse_task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the SSE subscription task
struct Inner {
    name: String,
    base: Url,
    headers: BTreeMap<String, String>,
    timeouts: BridgeTimeouts,
    client: reqwest::Client,
    state: Mutex<BridgeState>,
    endpoint: Mutex<Option<Url>>,
    session_id: Mutex<Option<String>>,
    notifications: broadcast::Sender<Value>,
}

enum StreamEnd {
    /// The server has no event stream; don't retry
    Unsupported,
    Closed,
}

impl HttpBridge {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        headers: BTreeMap<String, String>,
        timeouts: BridgeTimeouts,
    ) -> Result<Self> {
        let name = name.into();
        let base = Url::parse(url)
            .map_err(|e| Error::config(format!("bridge '{}' has an invalid url '{}': {}", name, url, e)))?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                base,
                headers,
                timeouts,
                client,
                state: Mutex::new(BridgeState::Unstarted),
                endpoint: Mutex::new(None),
                session_id: Mutex::new(None),
                notifications,
            }),
            next_id: AtomicU64::new(INITIALIZE_ID + 1),
            lifecycle: tokio::sync::Mutex::new(()),
            stop_tx,
            sse_task: Mutex::new(None),
        })
    }

    /// Endpoint chosen by auto-detection, once known
    pub fn endpoint(&self) -> Option<Url> {
        self.inner.endpoint()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    /// Run `fut` under `timeout`, giving up early when the bridge is stopped
    async fn guarded<F>(&self, method: &str, timeout: Duration, fut: F) -> Result<Value>
    where
        F: std::future::Future<Output = Result<Value>>,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(self.inner.stopped_error());
        }
        tokio::select! {
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(bridge = %self.inner.name, method = %method, "Bridge request timed out");
                    Err(Error::timeout(format!(
                        "bridge '{}' did not answer '{}' within {}ms",
                        self.inner.name,
                        method,
                        timeout.as_millis()
                    )))
                }
            },
            _ = stop_rx.changed() => Err(self.inner.stopped_error()),
        }
    }

    async fn request(&self, id: u64, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let mut request = McpRequest::new(method).with_id(id);
        request.params = params;

        let inner = self.inner.clone();
        self.guarded(method, timeout, async move {
            match inner.send(&request, Some(id)).await? {
                Some(message) => response_outcome(message),
                None => Err(Error::http(format!(
                    "bridge '{}' returned no response for '{}'",
                    inner.name, request.method
                ))),
            }
        })
        .await
    }

    async fn ensure_initialized(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            BridgeState::Initialized => return Ok(()),
            BridgeState::Stopped => return Err(self.inner.stopped_error()),
            BridgeState::Failed => {
                return Err(Error::exited(format!(
                    "bridge '{}' is not available (initialize failed)",
                    self.inner.name
                )))
            }
            BridgeState::Unstarted | BridgeState::Starting => {}
        }

        let outcome = self
            .request(
                INITIALIZE_ID,
                "initialize",
                Some(initialize_params()),
                self.inner.timeouts.initialize,
            )
            .await;

        match outcome {
            Ok(_) => {
                let note = McpNotification::new("notifications/initialized", None);
                if let Err(e) = self.inner.send(&note, None).await {
                    warn!(bridge = %self.inner.name, "Failed to send initialized notification: {}", e);
                }
                if self.state() == BridgeState::Stopped {
                    return Err(self.inner.stopped_error());
                }
                self.inner.set_state(BridgeState::Initialized);
                info!(
                    bridge = %self.inner.name,
                    endpoint = %self.endpoint().map(|u| u.to_string()).unwrap_or_default(),
                    "HTTP bridge initialized"
                );

                let task = tokio::spawn(subscribe_notifications(self.inner.clone()));
                if let Ok(mut slot) = self.sse_task.lock() {
                    *slot = Some(task);
                }
                Ok(())
            }
            Err(e) => {
                if self.state() != BridgeState::Stopped {
                    self.inner.set_state(BridgeState::Failed);
                    warn!(bridge = %self.inner.name, "HTTP bridge initialize failed: {}", e);
                }
                Err(e)
            }
        }
    }
}

impl Inner {
    fn state(&self) -> BridgeState {
        self.state.lock().map(|s| *s).unwrap_or(BridgeState::Failed)
    }

    fn set_state(&self, state: BridgeState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock().ok().and_then(|e| e.clone())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn stopped_error(&self) -> Error {
        Error::stopped(format!("bridge '{}' was stopped", self.name))
    }

    /// `/mcp` under the base URL, then the base URL itself
    fn candidates(&self) -> Vec<Url> {
        let path = self.base.path().trim_end_matches('/');
        if path.ends_with("/mcp") {
            return vec![self.base.clone()];
        }
        let mut mcp = self.base.clone();
        mcp.set_path(&format!("{}/mcp", path));
        vec![mcp, self.base.clone()]
    }

    /// Send a message, detecting the endpoint on first use. Returns the
    /// response message for requests, None for notifications.
    async fn send<T: Serialize>(&self, message: &T, id: Option<u64>) -> Result<Option<Value>> {
        if let Some(endpoint) = self.endpoint() {
            return self.post(endpoint, message, id).await;
        }

        let mut html_error = None;
        let mut last_error = None;
        for candidate in self.candidates() {
            match self.post(candidate.clone(), message, id).await {
                Ok(response) => {
                    debug!(bridge = %self.name, endpoint = %candidate, "Detected MCP endpoint");
                    if let Ok(mut slot) = self.endpoint.lock() {
                        *slot = Some(candidate);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    debug!(bridge = %self.name, endpoint = %candidate, "Endpoint probe failed: {}", e);
                    match e {
                        Error::Config(_) if html_error.is_none() => html_error = Some(e),
                        other => last_error = Some(other),
                    }
                }
            }
        }

        Err(html_error
            .or(last_error)
            .unwrap_or_else(|| Error::http(format!("bridge '{}' has no usable endpoint", self.name))))
    }

    async fn post<T: Serialize>(&self, mut url: Url, message: &T, id: Option<u64>) -> Result<Option<Value>> {
        for _ in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .post(url.clone())
                .header(ACCEPT, POST_ACCEPT)
                .json(message);
            for (key, value) in &self.headers {
                request = request.header(key.as_str(), value.as_str());
            }
            if let Some(session) = self.session_id() {
                request = request.header(SESSION_HEADER, session);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::http(format!("request to {} failed: {}", url, e)))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::http(format!("{} redirected without a Location header", url)))?;
                let next = url
                    .join(location)
                    .map_err(|e| Error::http(format!("invalid redirect location '{}': {}", location, e)))?;
                debug!(bridge = %self.name, from = %url, to = %next, "Following redirect");
                url = next;
                continue;
            }

            if let Some(session) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                if let Ok(mut slot) = self.session_id.lock() {
                    *slot = Some(session.to_string());
                }
            }

            let is_event_stream = content_type(response.headers()).starts_with("text/event-stream");
            let body = response
                .text()
                .await
                .map_err(|e| Error::http(format!("failed to read response from {}: {}", url, e)))?;

            if looks_like_html(&body) {
                return Err(Error::config(format!(
                    "bridge '{}': {} returned an HTML page instead of JSON-RPC; \
                     check that the configured url points at an MCP endpoint",
                    self.name, url
                )));
            }
            if !status.is_success() {
                return Err(Error::http(format!("{} returned HTTP {}", url, status)));
            }

            let Some(id) = id else {
                return Ok(None);
            };
            if status == StatusCode::ACCEPTED || body.trim().is_empty() {
                return Err(Error::http(format!("{} accepted the request without a response", url)));
            }

            let message = if is_event_stream {
                let (response, notes) = read_event_stream(&body, id);
                for note in notes {
                    trace!(bridge = %self.name, method = %note["method"], "Notification in POST reply");
                    let _ = self.notifications.send(note);
                }
                response.ok_or_else(|| {
                    Error::http(format!("no response with id {} in event stream from {}", id, url))
                })?
            } else {
                serde_json::from_str(&body)?
            };
            return Ok(Some(message));
        }

        Err(Error::http(format!(
            "too many redirects (more than {}) for bridge '{}'",
            MAX_REDIRECTS, self.name
        )))
    }

    fn sse_url(&self) -> Url {
        let mut url = self.base.clone();
        let path = self.base.path().trim_end_matches('/');
        let path = path.strip_suffix("/mcp").unwrap_or(path);
        url.set_path(&format!("{}/sse", path));
        url
    }

    async fn stream_notifications(&self) -> Result<StreamEnd> {
        let url = self.sse_url();
        let mut request = self.client.get(url.clone()).header(ACCEPT, "text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::http(format!("SSE request to {} failed: {}", url, e)))?;
        if !response.status().is_success()
            || !content_type(response.headers()).starts_with("text/event-stream")
        {
            return Ok(StreamEnd::Unsupported);
        }

        debug!(bridge = %self.name, url = %url, "Subscribed to bridge notifications");
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::http(format!("SSE stream error: {}", e)))?;
            for data in decoder.push(&chunk) {
                self.publish(&data);
            }
        }
        if let Some(data) = decoder.finish() {
            self.publish(&data);
        }
        Ok(StreamEnd::Closed)
    }

    fn publish(&self, data: &str) {
        let Ok(message) = serde_json::from_str::<Value>(data) else {
            debug!(bridge = %self.name, "Ignoring non-JSON SSE data");
            return;
        };
        if is_notification(&message) {
            let _ = self.notifications.send(message);
        }
    }
}

/// Keep an SSE subscription open while the bridge stays initialized
async fn subscribe_notifications(inner: Arc<Inner>) {
    while inner.state() == BridgeState::Initialized {
        match inner.stream_notifications().await {
            Ok(StreamEnd::Unsupported) => {
                debug!(bridge = %inner.name, "Bridge has no SSE endpoint; notifications unavailable");
                return;
            }
            Ok(StreamEnd::Closed) => debug!(bridge = %inner.name, "Bridge SSE stream ended"),
            Err(e) => debug!(bridge = %inner.name, "Bridge SSE stream failed: {}", e),
        }
        tokio::time::sleep(SSE_RECONNECT_DELAY).await;
    }
}

fn content_type(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Body of an HTML page rather than a JSON-RPC message
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(16).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

fn is_notification(message: &Value) -> bool {
    message.get("method").is_some() && message.get("id").map(Value::is_null).unwrap_or(true)
}

/// Response with `id` plus the notifications sent along with it in an
/// event-stream reply
fn read_event_stream(body: &str, id: u64) -> (Option<Value>, Vec<Value>) {
    let mut response = None;
    let mut notes = Vec::new();
    for message in decode_sse_events(body)
        .into_iter()
        .filter_map(|data| serde_json::from_str::<Value>(&data).ok())
    {
        if is_notification(&message) {
            notes.push(message);
        } else if response.is_none()
            && message.get("method").is_none()
            && message.get("id").and_then(numeric_id) == Some(id)
        {
            response = Some(message);
        }
    }
    (response, notes)
}

#[async_trait]
impl Bridge for HttpBridge {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> BridgeKind {
        BridgeKind::Http
    }

    fn state(&self) -> BridgeState {
        self.inner.state()
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            BridgeState::Unstarted => {
                self.inner.set_state(BridgeState::Starting);
                debug!(bridge = %self.inner.name, url = %self.inner.base, "HTTP bridge registered");
                Ok(())
            }
            BridgeState::Stopped => Err(self.inner.stopped_error()),
            _ => Ok(()),
        }
    }

    async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.state() == BridgeState::Unstarted {
            self.start().await?;
        }
        self.ensure_initialized().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.request(id, method, params, timeout).await
    }

    async fn stop(&self) {
        self.inner.set_state(BridgeState::Stopped);
        self.stop_tx.send_replace(true);
        let task = self.sse_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
        info!(bridge = %self.inner.name, "HTTP bridge stopped");
    }

    fn is_alive(&self) -> bool {
        self.state().is_usable()
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.inner.notifications.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(url: &str) -> HttpBridge {
        HttpBridge::new("remote", url, BTreeMap::new(), BridgeTimeouts::default()).unwrap()
    }

    #[test]
    fn test_candidates_try_mcp_first() {
        let b = bridge("http://localhost:9000");
        let candidates: Vec<String> = b.inner.candidates().iter().map(Url::to_string).collect();
        assert_eq!(candidates, vec!["http://localhost:9000/mcp", "http://localhost:9000/"]);

        let b = bridge("http://localhost:9000/api/");
        let candidates: Vec<String> = b.inner.candidates().iter().map(Url::to_string).collect();
        assert_eq!(
            candidates,
            vec!["http://localhost:9000/api/mcp", "http://localhost:9000/api/"]
        );

        let b = bridge("http://localhost:9000/mcp");
        assert_eq!(b.inner.candidates().len(), 1);
    }

    #[test]
    fn test_sse_url() {
        assert_eq!(bridge("http://h:1").inner.sse_url().as_str(), "http://h:1/sse");
        assert_eq!(bridge("http://h:1/x/mcp").inner.sse_url().as_str(), "http://h:1/x/sse");
    }

    #[test]
    fn test_html_detection() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(looks_like_html("\n  <HTML><body>404</body>"));
        assert!(!looks_like_html("{\"jsonrpc\":\"2.0\"}"));
    }

    #[test]
    fn test_read_event_stream_splits_response_and_notifications() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n";
        let (message, notes) = read_event_stream(body, 3);
        assert_eq!(message.unwrap()["result"]["ok"], true);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["method"], "notifications/progress");

        let (message, notes) = read_event_stream(body, 4);
        assert!(message.is_none());
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(
            HttpBridge::new("bad", "not a url", BTreeMap::new(), BridgeTimeouts::default()),
            Err(Error::Config(_))
        ));
    }
}
