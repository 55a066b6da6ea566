//! MCP Request Processor
//!
//! Transport-agnostic dispatch of JSON-RPC methods to the tool catalog, the
//! prompt and resource stores, and bridged providers. Every failure inside a
//! handler, panics included, ends up as a JSON-RPC error object; nothing here
//! takes the process down.

use crate::catalog::{ToolMerger, ToolOrigin};
use crate::content::{ContentChange, ContentHandler, ContentKind, PromptStore, ResourceStore};
use crate::schema::unflatten_arguments;
use crate::{SERVER_NAME, SERVER_VERSION};
use anyhow::{Context, Result};
use easy_bridge::{BridgeEvent, BridgeSource};
use easy_core::protocol::error_codes;
use easy_core::{
    JsonRpcError, McpNotification, McpRequest, McpResponse, ParameterLocation, RouteDescriptor,
    RouteRequest, Settings, PROTOCOL_VERSION,
};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 256;

/// Server configuration
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Name reported in `initialize`
    pub name: String,
    /// Attach cause chain, backtrace and request context to internal errors
    pub detailed_errors: bool,
    pub bridge_call_timeout: Duration,
    pub bridge_list_timeout: Duration,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            detailed_errors: false,
            bridge_call_timeout: Duration::from_secs(10),
            bridge_list_timeout: Duration::from_secs(10),
        }
    }
}

impl McpServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            name: settings.name.clone(),
            detailed_errors: settings.detailed_errors,
            bridge_call_timeout: settings.bridge_call_timeout(),
            bridge_list_timeout: settings.bridge_list_timeout(),
        }
    }
}

/// Unified MCP Server
pub struct McpServer {
    config: McpServerConfig,
    tools: Arc<ToolMerger>,
    prompts: Option<Arc<PromptStore>>,
    resources: Option<Arc<ResourceStore>>,
    notifications: broadcast::Sender<McpNotification>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl McpServer {
    pub fn new(
        config: McpServerConfig,
        routes: Vec<RouteDescriptor>,
        bridges: Option<Arc<dyn BridgeSource>>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let tools = Arc::new(ToolMerger::new(routes, bridges, config.bridge_list_timeout));
        Self {
            config,
            tools,
            prompts: None,
            resources: None,
            notifications,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptStore>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn with_resources(mut self, resources: Arc<ResourceStore>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolMerger> {
        &self.tools
    }

    /// Server-initiated notifications for every connected client
    pub fn subscribe(&self) -> broadcast::Receiver<McpNotification> {
        self.notifications.subscribe()
    }

    /// Publish a notification to every subscribed transport
    pub fn notify(&self, notification: McpNotification) {
        debug!(method = %notification.method, "Publishing notification");
        let _ = self.notifications.send(notification);
    }

    /// Start forwarding bridge events and content changes as MCP
    /// notifications. Call once, from inside the runtime.
    pub fn start_notifications(&self, bridge_events: Option<broadcast::Receiver<BridgeEvent>>) {
        let mut tasks = Vec::new();

        if let Some(mut events) = bridge_events {
            let tx = self.notifications.clone();
            let tools = self.tools.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(BridgeEvent::Notification { bridge, message }) => {
                            let Some(method) = message.get("method").and_then(Value::as_str) else {
                                continue;
                            };
                            debug!(bridge = %bridge, method = %method, "Forwarding bridge notification");
                            let params = message.get("params").cloned();
                            let _ = tx.send(McpNotification::new(method, params));
                        }
                        Ok(BridgeEvent::Restarted { count }) => {
                            info!(count, "Bridges restarted, tool list changed");
                            tools.invalidate().await;
                            let _ = tx.send(McpNotification::new(
                                "notifications/tools/list_changed",
                                None,
                            ));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Dropped bridge events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        let stores: [Option<Arc<dyn ContentHandler>>; 2] = [
            self.prompts.clone().map(|p| p as Arc<dyn ContentHandler>),
            self.resources.clone().map(|r| r as Arc<dyn ContentHandler>),
        ];
        for store in stores.into_iter().flatten() {
            let mut changes = store.subscribe();
            let tx = self.notifications.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            let _ = tx.send(list_changed(&change));
                        }
                        Err(RecvError::Lagged(_)) => {
                            let kind = store.kind();
                            let _ = tx.send(list_changed(&ContentChange {
                                kind,
                                key: String::new(),
                                removed: false,
                            }));
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.extend(tasks);
        }
    }

    /// Handle an MCP request. Always produces a response; transports drop it
    /// for notifications.
    pub async fn handle_request(&self, request: McpRequest) -> McpResponse {
        debug!(method = %request.method, "Handling MCP request");

        let id = request.id.clone();
        let method = request.method.clone();
        let params = request.params.clone();

        match AssertUnwindSafe(self.dispatch(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!(method = %method, "Request failed: {:#}", err);
                let chain = err.chain().map(|cause| cause.to_string()).collect();
                let backtrace = err.backtrace().to_string();
                McpResponse::error(
                    id,
                    self.internal_error(format!("{:#}", err), chain, backtrace, &method, params),
                )
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(method = %method, "Handler panicked: {}", message);
                let backtrace = std::backtrace::Backtrace::capture().to_string();
                McpResponse::error(
                    id,
                    self.internal_error(
                        format!("Internal error: {}", message),
                        vec![message],
                        backtrace,
                        &method,
                        params,
                    ),
                )
            }
        }
    }

    async fn dispatch(&self, request: McpRequest) -> Result<McpResponse> {
        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "initialized" | "notifications/initialized" => {
                McpResponse::success(request.id, json!({}))
            }
            "ping" => McpResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request).await,
            "tools/call" => self.handle_tools_call(request).await?,
            "prompts/list" => self.handle_prompts_list(request),
            "prompts/get" => self.handle_prompts_get(request),
            "resources/list" => self.handle_resources_list(request),
            "resources/read" => self.handle_resources_read(request),
            _ => McpResponse::error(request.id, JsonRpcError::method_not_found(&request.method)),
        };
        Ok(response)
    }

    fn internal_error(
        &self,
        message: String,
        chain: Vec<String>,
        backtrace: String,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcError {
        let error = JsonRpcError::internal_error(message);
        if !self.config.detailed_errors {
            return error;
        }
        error.with_data(json!({
            "chain": chain,
            "backtrace": backtrace,
            "context": {
                "method": method,
                "params": params,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }))
    }

    fn handle_initialize(&self, request: McpRequest) -> McpResponse {
        let client_info = request.params.as_ref().and_then(|p| p.get("clientInfo"));
        let client_name = client_info
            .and_then(|ci| ci.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let client_version = client_info
            .and_then(|ci| ci.get("version"))
            .and_then(Value::as_str);

        info!(
            client = %client_name,
            version = %client_version.unwrap_or("?"),
            "Client connected"
        );

        McpResponse::success(
            request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true },
                    "prompts": { "listChanged": true },
                    "resources": { "subscribe": false, "listChanged": true }
                },
                "serverInfo": {
                    "name": self.config.name,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    async fn handle_tools_list(&self, request: McpRequest) -> McpResponse {
        let catalog = self.tools.build().await;
        debug!(tools = catalog.len(), "Tool catalog built");
        McpResponse::success(request.id, catalog.to_list_result())
    }

    async fn handle_tools_call(&self, request: McpRequest) -> Result<McpResponse> {
        let params = request.params.as_ref();
        let Some(name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
            return Ok(McpResponse::error(
                request.id,
                JsonRpcError::invalid_params("Missing tool name"),
            ));
        };
        let arguments = match params.and_then(|p| p.get("arguments")) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return Ok(McpResponse::error(
                    request.id,
                    JsonRpcError::invalid_params("Tool arguments must be an object"),
                ))
            }
        };

        let Some((catalog, tool)) = self.tools.resolve(name).await else {
            warn!(tool = %name, "Unknown tool");
            return Ok(McpResponse::error(
                request.id,
                JsonRpcError::internal_error(format!("Tool not found: {}", name)),
            ));
        };

        match &tool.origin {
            ToolOrigin::Bridge {
                provider,
                original_name,
            } => Ok(self
                .call_bridge_tool(request.id, provider, original_name, arguments)
                .await),
            ToolOrigin::Route(index) => {
                let route = catalog
                    .route(*index)
                    .with_context(|| format!("route for tool '{}' is gone", name))?;
                self.call_route(request.id, route, arguments).await
            }
        }
    }

    async fn call_bridge_tool(
        &self,
        id: Option<Value>,
        provider: &str,
        original_name: &str,
        arguments: Map<String, Value>,
    ) -> McpResponse {
        let Some(bridge) = self.tools.bridge(provider).await else {
            return McpResponse::error(
                id,
                JsonRpcError::internal_error(format!("Bridge '{}' is not available", provider)),
            );
        };

        debug!(bridge = %provider, tool = %original_name, "Calling bridge tool");
        let params = json!({ "name": original_name, "arguments": arguments });
        match bridge
            .call("tools/call", Some(params), self.config.bridge_call_timeout)
            .await
        {
            Ok(result) => McpResponse::success(id, result),
            Err(e) => {
                warn!(bridge = %provider, tool = %original_name, "Bridge call failed: {}", e);
                McpResponse::error(
                    id,
                    JsonRpcError::internal_error(format!(
                        "Bridge '{}' failed to run '{}': {}",
                        provider, original_name, e
                    )),
                )
            }
        }
    }

    async fn call_route(
        &self,
        id: Option<Value>,
        route: &RouteDescriptor,
        arguments: Map<String, Value>,
    ) -> Result<McpResponse> {
        let route_request = match build_route_request(route, arguments) {
            Ok(r) => r,
            Err(e) => return Ok(McpResponse::error(id, e)),
        };
        debug!(method = %route_request.method, path = %route_request.path, "Invoking route");

        let response = route
            .handler
            .invoke(route_request)
            .await
            .with_context(|| format!("{} {} failed", route.method, route.path))?;

        let text = match &response.body {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        Ok(McpResponse::success(
            id,
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": response.is_error()
            }),
        ))
    }

    fn handle_prompts_list(&self, request: McpRequest) -> McpResponse {
        let prompts: Vec<Value> = self
            .prompts
            .as_ref()
            .map(|store| store.list().iter().map(|p| p.to_list_entry()).collect())
            .unwrap_or_default();
        McpResponse::success(request.id, json!({ "prompts": prompts }))
    }

    fn handle_prompts_get(&self, request: McpRequest) -> McpResponse {
        let params = request.params.as_ref();
        let Some(name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
            return McpResponse::error(request.id, JsonRpcError::invalid_params("Missing prompt name"));
        };
        let Some(prompt) = self.prompts.as_ref().and_then(|store| store.get(name)) else {
            return McpResponse::error(
                request.id,
                JsonRpcError::invalid_params(format!("Prompt not found: {}", name)),
            );
        };

        let arguments = params
            .and_then(|p| p.get("arguments"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        McpResponse::success(
            request.id,
            json!({
                "description": prompt.description,
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": prompt.render(&arguments) }
                }]
            }),
        )
    }

    fn handle_resources_list(&self, request: McpRequest) -> McpResponse {
        let resources: Vec<Value> = self
            .resources
            .as_ref()
            .map(|store| store.list().iter().map(|r| r.to_list_entry()).collect())
            .unwrap_or_default();
        McpResponse::success(request.id, json!({ "resources": resources }))
    }

    fn handle_resources_read(&self, request: McpRequest) -> McpResponse {
        let params = request.params.as_ref();
        let uri = params
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if uri.is_empty() {
            return McpResponse::error(request.id, JsonRpcError::invalid_params("Missing uri"));
        }

        let Some(resource) = self.resources.as_ref().and_then(|store| store.get(uri)) else {
            return McpResponse::error(
                request.id,
                JsonRpcError::new(
                    error_codes::RESOURCE_NOT_FOUND,
                    format!("Resource not found: {}", uri),
                ),
            );
        };

        let arguments = params.and_then(|p| p.get("arguments")).and_then(Value::as_object);
        McpResponse::success(
            request.id,
            json!({
                "contents": [{
                    "uri": resource.uri,
                    "mimeType": resource.mime_type,
                    "text": resource.read(arguments)
                }]
            }),
        )
    }
}

impl Drop for McpServer {
    fn drop(&mut self) {
        if let Ok(forwarders) = self.forwarders.lock() {
            for task in forwarders.iter() {
                task.abort();
            }
        }
    }
}

fn list_changed(change: &ContentChange) -> McpNotification {
    let method = match change.kind {
        ContentKind::Prompt => "notifications/prompts/list_changed",
        ContentKind::Resource => "notifications/resources/list_changed",
    };
    McpNotification::new(method, None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Name of a `:name` or `{name}` path segment
fn path_placeholder(segment: &str) -> Option<&str> {
    segment
        .strip_prefix(':')
        .or_else(|| segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
        .filter(|name| !name.is_empty())
}

/// Replace path placeholders with the supplied values
pub fn substitute_path(path: &str, params: &Map<String, Value>) -> String {
    path.split('/')
        .map(|segment| match path_placeholder(segment).and_then(|name| params.get(name)) {
            Some(value) => value_to_string(value),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Synthetic route request from tool arguments.
///
/// Declared parameters go to their query/header/path slot, undeclared path
/// placeholders are filled by name, everything else becomes the body with
/// dotted keys expanded.
pub fn build_route_request(
    route: &RouteDescriptor,
    mut arguments: Map<String, Value>,
) -> std::result::Result<RouteRequest, JsonRpcError> {
    let mut request = RouteRequest {
        method: route.method.clone(),
        ..Default::default()
    };

    for param in &route.metadata.parameters {
        let Some(value) = arguments.remove(&param.name) else {
            if param.required {
                return Err(JsonRpcError::invalid_params(format!(
                    "Missing required parameter: {}",
                    param.name
                )));
            }
            continue;
        };
        match param.location {
            ParameterLocation::Query => {
                request.query.insert(param.name.clone(), value);
            }
            ParameterLocation::Header => {
                request
                    .headers
                    .insert(param.name.to_ascii_lowercase(), value_to_string(&value));
            }
            ParameterLocation::Path => {
                request.params.insert(param.name.clone(), value);
            }
        }
    }

    for segment in route.path.split('/') {
        if let Some(name) = path_placeholder(segment) {
            if request.params.contains_key(name) {
                continue;
            }
            match arguments.remove(name) {
                Some(value) => {
                    request.params.insert(name.to_string(), value);
                }
                None => {
                    return Err(JsonRpcError::invalid_params(format!(
                        "Missing required parameter: {}",
                        name
                    )))
                }
            }
        }
    }

    request.path = substitute_path(&route.path, &request.params);
    request.body = Value::Object(unflatten_arguments(arguments));
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_core::{handler_fn, ParameterSpec, RouteMetadata, RouteResponse};

    fn echo_route(method: &str, path: &str, parameters: Vec<ParameterSpec>) -> RouteDescriptor {
        RouteDescriptor::new(
            method,
            path,
            handler_fn(|req: RouteRequest| async move {
                Ok(RouteResponse::ok(json!({
                    "path": req.path,
                    "query": req.query,
                    "headers": req.headers,
                    "body": req.body,
                })))
            }),
        )
        .with_metadata(RouteMetadata {
            parameters,
            ..Default::default()
        })
    }

    fn request(method: &str, id: i64, params: Value) -> McpRequest {
        McpRequest::new(method).with_id(id).with_params(params)
    }

    #[test]
    fn test_substitute_path() {
        let params = json!({"id": 7, "slug": "intro"});
        let params = params.as_object().unwrap();
        assert_eq!(substitute_path("/users/:id/posts/{slug}", params), "/users/7/posts/intro");
        assert_eq!(substitute_path("/users/:other", params), "/users/:other");
    }

    #[test]
    fn test_build_route_request_maps_arguments() {
        let route = echo_route(
            "PUT",
            "/users/:id",
            vec![
                ParameterSpec::new("verbose", ParameterLocation::Query),
                ParameterSpec::new("X-Trace", ParameterLocation::Header),
            ],
        );
        let args = json!({"id": "42", "verbose": true, "X-Trace": 9, "name": "Ada", "address.city": "Paris"});
        let req = build_route_request(&route, args.as_object().unwrap().clone()).unwrap();

        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/users/42");
        assert_eq!(req.params["id"], "42");
        assert_eq!(req.query["verbose"], true);
        assert_eq!(req.headers["x-trace"], "9");
        assert_eq!(req.body, json!({"name": "Ada", "address": {"city": "Paris"}}));
    }

    #[test]
    fn test_build_route_request_missing_required() {
        let route = echo_route(
            "GET",
            "/items",
            vec![ParameterSpec::new("q", ParameterLocation::Query).required()],
        );
        let err = build_route_request(&route, Map::new()).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);

        let route = echo_route("GET", "/items/{id}", vec![]);
        let err = build_route_request(&route, Map::new()).unwrap_err();
        assert!(err.message.contains("id"));
    }

    #[tokio::test]
    async fn test_local_route_call_wraps_text_content() {
        let route = echo_route("GET", "/users/:id", vec![]);
        let server = McpServer::new(McpServerConfig::default(), vec![route], None);

        let response = server
            .handle_request(request("tools/call", 1, json!({"name": "get_users_id", "arguments": {"id": 5}})))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        let text: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["path"], "/users/5");
    }

    #[tokio::test]
    async fn test_error_status_sets_is_error() {
        let route = RouteDescriptor::new(
            "GET",
            "/broken",
            handler_fn(|_| async { Ok(RouteResponse::with_status(404, json!("no such thing"))) }),
        );
        let server = McpServer::new(McpServerConfig::default(), vec![route], None);
        let result = server
            .handle_request(request("tools/call", 2, json!({"name": "get_broken"})))
            .await
            .result
            .unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "no such thing");
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_internal_errors() {
        let failing = RouteDescriptor::new(
            "GET",
            "/fail",
            handler_fn(|_| async { Err(anyhow::anyhow!("database unavailable")) }),
        );
        let panicking = RouteDescriptor::new(
            "GET",
            "/panic",
            handler_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(RouteResponse::ok(Value::Null))
            }),
        );
        let config = McpServerConfig {
            detailed_errors: true,
            ..Default::default()
        };
        let server = McpServer::new(config, vec![failing, panicking], None);

        let error = server
            .handle_request(request("tools/call", 3, json!({"name": "get_fail"})))
            .await
            .error
            .unwrap();
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert!(error.message.contains("database unavailable"));
        let data = error.data.unwrap();
        assert_eq!(data["context"]["method"], "tools/call");
        assert!(data["chain"].as_array().unwrap().len() >= 2);
        assert!(data["context"]["timestamp"].is_string());

        let error = server
            .handle_request(request("tools/call", 4, json!({"name": "get_panic"})))
            .await
            .error
            .unwrap();
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert!(error.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_errors_without_detail_carry_no_data() {
        let failing = RouteDescriptor::new(
            "GET",
            "/fail",
            handler_fn(|_| async { Err(anyhow::anyhow!("nope")) }),
        );
        let server = McpServer::new(McpServerConfig::default(), vec![failing], None);
        let error = server
            .handle_request(request("tools/call", 1, json!({"name": "get_fail"})))
            .await
            .error
            .unwrap();
        assert!(error.data.is_none());
    }

    #[tokio::test]
    async fn test_bridge_restart_publishes_tools_list_changed() {
        let server = McpServer::new(McpServerConfig::default(), vec![], None);
        let (events_tx, events_rx) = broadcast::channel(8);
        server.start_notifications(Some(events_rx));
        let mut notes = server.subscribe();

        events_tx.send(BridgeEvent::Restarted { count: 2 }).unwrap();
        let note = tokio::time::timeout(Duration::from_secs(2), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/tools/list_changed");

        events_tx
            .send(BridgeEvent::Notification {
                bridge: "github".into(),
                message: json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
            })
            .unwrap();
        let note = tokio::time::timeout(Duration::from_secs(2), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/message");
        assert_eq!(note.params.unwrap()["level"], "info");
    }
}
