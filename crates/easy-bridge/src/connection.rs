//! JSON-RPC connection over a byte stream
//!
//! Owns the pending-request map. Each outbound request registers a oneshot
//! keyed by its numeric id before the frame is written; the reader task
//! resolves it when a response with that id comes back. Requests that time
//! out are evicted, so a late response finds no entry and is dropped.

use easy_core::framing::{write_frame, FrameDecoder};
use easy_core::protocol::{JsonRpcError, McpNotification, McpRequest, McpResponse};
use easy_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Id used for the `initialize` handshake
pub const INITIALIZE_ID: u64 = 0;

const READ_CHUNK: usize = 8 * 1024;
pub(crate) const NOTIFICATION_CAPACITY: usize = 256;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

struct Shared {
    name: String,
    writer: tokio::sync::Mutex<BoxWriter>,
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
    notifications: broadcast::Sender<Value>,
}

impl Shared {
    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.lock().ok().and_then(|mut pending| pending.remove(&id))
    }

    fn fail_all<F: Fn() -> Error>(&self, make_error: F) -> usize {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    async fn write<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, message).await
    }

    async fn dispatch(&self, message: Value) {
        let id = message.get("id").filter(|id| !id.is_null()).cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        match (id, method) {
            (None, Some(method)) => {
                trace!(bridge = %self.name, method = %method, "Notification from bridge");
                // No receivers is fine
                let _ = self.notifications.send(message);
            }
            (Some(id), Some(method)) => self.answer_peer_request(id, &method).await,
            (Some(id), None) => self.resolve(id, message),
            (None, None) => {
                debug!(bridge = %self.name, "Ignoring message with neither id nor method");
            }
        }
    }

    async fn answer_peer_request(&self, id: Value, method: &str) {
        let response = if method == "ping" {
            McpResponse::success(id, json!({}))
        } else {
            debug!(bridge = %self.name, method = %method, "Rejecting request from bridge");
            McpResponse::error(id, JsonRpcError::method_not_found(method))
        };
        if let Err(e) = self.write(&response).await {
            warn!(bridge = %self.name, "Failed to answer bridge request: {}", e);
        }
    }

    fn resolve(&self, id: Value, message: Value) {
        let Some(id) = numeric_id(&id) else {
            debug!(bridge = %self.name, id = %id, "Dropping response with foreign id");
            return;
        };
        let Some(tx) = self.take_pending(id) else {
            debug!(bridge = %self.name, id, "Dropping response for unknown or expired request");
            return;
        };

        let _ = tx.send(response_outcome(message));
    }
}

/// Evicts a pending entry when the request ends, however it ends. Removal is
/// idempotent, so an entry already taken by the reader is a no-op.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.take_pending(self.id).is_some() {
            trace!(bridge = %self.shared.name, id = self.id, "Evicted pending request");
        }
    }
}

/// Turn a response message into the caller's result
pub(crate) fn response_outcome(message: Value) -> Result<Value> {
    match serde_json::from_value::<McpResponse>(message) {
        Ok(McpResponse {
            error: Some(error), ..
        }) => Err(Error::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        Ok(response) => Ok(response.result.unwrap_or(Value::Null)),
        Err(e) => Err(Error::internal(format!("malformed response from bridge: {}", e))),
    }
}

/// Ids come back as numbers, but some peers echo them as strings
pub(crate) fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Request/response correlation over one reader/writer pair
pub struct RpcConnection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcConnection {
    /// Start the reader task. Must be called inside a tokio runtime.
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self::with_notifier(name, reader, writer, notifications)
    }

    /// Like [`RpcConnection::new`], publishing peer notifications on an
    /// existing channel
    pub fn with_notifier<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        notifications: broadcast::Sender<Value>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            notifications,
        });

        let reader_task = tokio::spawn(read_loop(shared.clone(), reader));

        Self {
            shared,
            next_id: AtomicU64::new(INITIALIZE_ID + 1),
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Send a request with the next id and wait for its response
    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.request_with_id(id, method, params, timeout).await
    }

    /// Send a request with a caller-chosen id
    pub async fn request_with_id(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::stopped(format!(
                "bridge '{}' connection is closed",
                self.shared.name
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .map_err(|_| Error::internal("pending request map poisoned"))?
            .insert(id, tx);
        // Also covers the caller dropping this future mid-flight
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let mut request = McpRequest::new(method).with_id(id);
        request.params = params;

        debug!(bridge = %self.shared.name, id, method = %method, "Sending request to bridge");
        self.shared.write(&request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::exited(format!(
                "bridge '{}' dropped request {}",
                self.shared.name, id
            ))),
            Err(_) => {
                warn!(bridge = %self.shared.name, id, method = %method, "Bridge request timed out");
                Err(Error::timeout(format!(
                    "bridge '{}' did not answer '{}' within {}ms",
                    self.shared.name,
                    method,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Send a notification (no id, no response)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.shared.write(&McpNotification::new(method, params)).await
    }

    /// Reject every pending request, returning how many were rejected
    pub fn fail_all<F: Fn() -> Error>(&self, make_error: F) -> usize {
        self.shared.fail_all(make_error)
    }

    /// Mark closed, reject pending requests with a "stopped" error and stop
    /// reading
    pub fn close(&self, reason: &str) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let rejected = self.shared.fail_all(|| Error::stopped(reason.to_string()));
        if rejected > 0 {
            debug!(bridge = %self.shared.name, rejected, "Rejected pending requests on close");
        }
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Notifications (messages with a method and no id) sent by the peer
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.shared.notifications.subscribe()
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(bridge = %shared.name, "Read error from bridge: {}", e);
                break;
            }
        };

        decoder.push(&buf[..n]);
        for frame in decoder.drain() {
            match frame {
                Ok(message) => shared.dispatch(message).await,
                Err(e) => warn!(bridge = %shared.name, "Discarding bad frame from bridge: {}", e),
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    let name = shared.name.clone();
    let rejected = shared.fail_all(|| Error::exited(format!("bridge '{}' closed its output", name)));
    debug!(bridge = %shared.name, rejected, "Bridge output closed");
}
