//! Tool Merger
//!
//! Builds the tool catalog a client sees: local routes first, then every live
//! bridge in configuration order. Names are unique; the first registration
//! wins and later duplicates are dropped with a warning.

use crate::schema::{flatten_body, normalize, parameter_schema};
use easy_bridge::{Bridge, BridgeSource};
use easy_core::RouteDescriptor;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Where a tool call is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOrigin {
    /// Index into the catalog's route snapshot
    Route(usize),
    /// Tool advertised by a bridged provider under `original_name`
    Bridge {
        provider: String,
        original_name: String,
    },
}

/// Tool entry as listed by `tools/list`
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(skip)]
    pub origin_method: Option<String>,
    #[serde(skip)]
    pub origin_path: Option<String>,
    #[serde(skip)]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub origin: ToolOrigin,
}

impl ToolDefinition {
    pub fn is_bridged(&self) -> bool {
        matches!(self.origin, ToolOrigin::Bridge { .. })
    }
}

/// Tool name for a route: `GET /users/:id` → `get_users_id`
pub fn tool_name_for(method: &str, path: &str) -> String {
    let mut name = method.to_ascii_lowercase();
    let mut segments = 0;

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let segment = segment.trim_start_matches(':');
        let segment = segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(segment);
        let cleaned: String = segment
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let cleaned = cleaned.trim_matches('_');
        if cleaned.is_empty() {
            continue;
        }
        name.push('_');
        name.push_str(cleaned);
        segments += 1;
    }

    if segments == 0 {
        name.push_str("_root");
    }

    // Collapse runs produced by punctuation
    let mut collapsed = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed
}

/// Tool definition synthesized from a route's metadata
pub fn route_tool(route: &RouteDescriptor, index: usize) -> ToolDefinition {
    let meta = &route.metadata;
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in &meta.parameters {
        properties.insert(param.name.clone(), parameter_schema(param));
        if param.required && !required.contains(&param.name) {
            required.push(param.name.clone());
        }
    }

    if let Some(body) = &meta.request_body {
        let flat = flatten_body(body);
        for (key, schema) in flat.properties {
            // Declared parameters take precedence over body fields
            if properties.contains_key(&key) {
                continue;
            }
            if flat.required.contains(&key) {
                required.push(key.clone());
            }
            properties.insert(key, schema);
        }
    }

    let mut input_schema = json!({ "type": "object", "properties": properties });
    if !required.is_empty() {
        input_schema["required"] = json!(required);
    }

    let description = meta
        .description
        .clone()
        .or_else(|| meta.summary.clone())
        .unwrap_or_else(|| format!("{} {}", route.method, route.path));

    ToolDefinition {
        name: tool_name_for(&route.method, &route.path),
        description,
        input_schema,
        response_schema: meta.response_schema.as_ref().map(normalize),
        origin_method: Some(route.method.clone()),
        origin_path: Some(route.path.clone()),
        tags: meta.tags.clone(),
        origin: ToolOrigin::Route(index),
    }
}

/// Strip a `<provider>_` or `mcp_` prefix from a bridged tool name
fn public_name(provider: &str, name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let provider_prefix = format!("{}_", provider.to_ascii_lowercase());
    for prefix in [provider_prefix.as_str(), "mcp_"] {
        if lower.starts_with(prefix) && name.len() > prefix.len() {
            return name[prefix.len()..].to_string();
        }
    }
    name.to_string()
}

/// Deduplicated set of tools at one point in time
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
    routes: Arc<Vec<RouteDescriptor>>,
}

impl ToolCatalog {
    /// Catalog holding only the local routes
    pub fn from_routes(routes: Arc<Vec<RouteDescriptor>>) -> Self {
        let mut catalog = Self {
            routes: routes.clone(),
            ..Default::default()
        };
        for (i, route) in routes.iter().enumerate() {
            let tool = route_tool(route, i);
            if !catalog.register(tool) {
                warn!(method = %route.method, path = %route.path, "Duplicate route tool name skipped");
            }
        }
        catalog
    }

    /// Query every live bridge for its tools and merge them after the local
    /// routes. Providers are queried concurrently and merged in source order.
    /// A provider that fails or times out is skipped.
    pub async fn build(
        routes: Arc<Vec<RouteDescriptor>>,
        bridges: Option<&dyn BridgeSource>,
        list_timeout: Duration,
    ) -> Self {
        let mut catalog = Self::from_routes(routes);
        let Some(source) = bridges else {
            return catalog;
        };

        let bridges = source.live_bridges().await;
        let listed = join_all(
            bridges
                .iter()
                .map(|bridge| list_bridge_tools(bridge.as_ref(), list_timeout)),
        )
        .await;

        for (bridge, result) in bridges.iter().zip(listed) {
            match result {
                Ok(result) => {
                    let added = catalog.add_bridge_tools(bridge.name(), &result);
                    debug!(bridge = %bridge.name(), added, "Merged bridge tools");
                }
                Err(e) => warn!(bridge = %bridge.name(), "tools/list failed, skipping: {}", e),
            }
        }
        catalog
    }

    /// Merge the result of a provider's `tools/list`; returns how many tools
    /// were added
    pub fn add_bridge_tools(&mut self, provider: &str, result: &Value) -> usize {
        let Some(tools) = result.get("tools").and_then(Value::as_array) else {
            return 0;
        };

        let mut added = 0;
        for tool in tools {
            let Some(original) = tool.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) else {
                warn!(bridge = %provider, "Bridge tool without a name rejected");
                continue;
            };
            let name = public_name(provider, original);
            let definition = ToolDefinition {
                name: name.clone(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: normalize(
                    tool.get("inputSchema")
                        .unwrap_or(&json!({ "type": "object" })),
                ),
                response_schema: None,
                origin_method: None,
                origin_path: None,
                tags: Vec::new(),
                origin: ToolOrigin::Bridge {
                    provider: provider.to_string(),
                    original_name: original.to_string(),
                },
            };
            if self.register(definition) {
                added += 1;
            } else {
                warn!(bridge = %provider, tool = %name, "Tool name already registered, skipping");
            }
        }
        added
    }

    fn register(&mut self, tool: ToolDefinition) -> bool {
        if self.index.contains_key(&tool.name) {
            return false;
        }
        self.index.insert(tool.name.clone(), self.tools.len());
        self.tools.push(tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Route behind a route-origin tool
    pub fn route(&self, index: usize) -> Option<&RouteDescriptor> {
        self.routes.get(index)
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `tools/list` result payload
    pub fn to_list_result(&self) -> Value {
        json!({ "tools": self.tools })
    }
}

async fn list_bridge_tools(bridge: &dyn Bridge, timeout: Duration) -> easy_core::Result<Value> {
    bridge.call("tools/list", Some(json!({})), timeout).await
}

/// Holds the route table and the last built catalog
pub struct ToolMerger {
    routes: std::sync::RwLock<Arc<Vec<RouteDescriptor>>>,
    bridges: Option<Arc<dyn BridgeSource>>,
    list_timeout: Duration,
    last: RwLock<Option<Arc<ToolCatalog>>>,
}

impl ToolMerger {
    pub fn new(
        routes: Vec<RouteDescriptor>,
        bridges: Option<Arc<dyn BridgeSource>>,
        list_timeout: Duration,
    ) -> Self {
        Self {
            routes: std::sync::RwLock::new(Arc::new(routes)),
            bridges,
            list_timeout,
            last: RwLock::new(None),
        }
    }

    fn route_snapshot(&self) -> Arc<Vec<RouteDescriptor>> {
        self.routes
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Replace the route table; the next build picks it up
    pub async fn set_routes(&self, routes: Vec<RouteDescriptor>) {
        match self.routes.write() {
            Ok(mut guard) => *guard = Arc::new(routes),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(routes),
        }
        self.invalidate().await;
    }

    /// Build a fresh catalog, querying bridges live
    pub async fn build(&self) -> Arc<ToolCatalog> {
        let catalog = Arc::new(
            ToolCatalog::build(self.route_snapshot(), self.bridges.as_deref(), self.list_timeout).await,
        );
        *self.last.write().await = Some(catalog.clone());
        catalog
    }

    /// Find a tool in the last catalog, rebuilding once on a miss
    pub async fn resolve(&self, name: &str) -> Option<(Arc<ToolCatalog>, ToolDefinition)> {
        if let Some(catalog) = self.last.read().await.clone() {
            if let Some(tool) = catalog.get(name) {
                let tool = tool.clone();
                return Some((catalog, tool));
            }
        }
        let catalog = self.build().await;
        let tool = catalog.get(name)?.clone();
        Some((catalog, tool))
    }

    /// Drop the cached catalog (after a bridge restart)
    pub async fn invalidate(&self) {
        *self.last.write().await = None;
    }

    /// Live bridge by provider name
    pub async fn bridge(&self, provider: &str) -> Option<Arc<dyn Bridge>> {
        let source = self.bridges.as_ref()?;
        source
            .live_bridges()
            .await
            .into_iter()
            .find(|b| b.name() == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_core::{handler_fn, ParameterLocation, ParameterSpec, RouteMetadata, RouteResponse};

    fn route(method: &str, path: &str) -> RouteDescriptor {
        RouteDescriptor::new(
            method,
            path,
            handler_fn(|_| async { Ok(RouteResponse::ok(json!({}))) }),
        )
    }

    #[test]
    fn test_tool_names() {
        assert_eq!(tool_name_for("GET", "/users/:id"), "get_users_id");
        assert_eq!(tool_name_for("post", "/users/{userId}/posts"), "post_users_userid_posts");
        assert_eq!(tool_name_for("GET", "/"), "get_root");
        assert_eq!(tool_name_for("DELETE", "/api/v1/items-list/"), "delete_api_v1_items_list");
    }

    #[test]
    fn test_route_tool_schema() {
        let route = route("POST", "/users/:id").with_metadata(RouteMetadata {
            summary: Some("Update user".into()),
            parameters: vec![
                ParameterSpec::new("id", ParameterLocation::Path),
                ParameterSpec::new("dryRun", ParameterLocation::Query)
                    .with_schema(json!({"type": "bool"})),
            ],
            request_body: Some(json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "address": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
                },
                "required": ["name"]
            })),
            response_schema: Some(json!({"type": "object"})),
            ..Default::default()
        });

        let tool = route_tool(&route, 0);
        assert_eq!(tool.name, "post_users_id");
        assert_eq!(tool.description, "Update user");
        assert_eq!(tool.input_schema["properties"]["dryRun"]["type"], "boolean");
        assert_eq!(tool.input_schema["properties"]["address.city"]["type"], "string");
        assert_eq!(tool.input_schema["required"], json!(["id", "address.city", "name"]));
        assert_eq!(tool.response_schema, Some(json!({"type": "object", "properties": {}})));
        assert_eq!(tool.origin, ToolOrigin::Route(0));

        let listed = serde_json::to_value(&tool).unwrap();
        assert!(listed.get("inputSchema").is_some());
        assert!(listed.get("origin").is_none());
    }

    #[test]
    fn test_bridge_prefix_stripping_and_first_wins() {
        let routes = Arc::new(vec![route("GET", "/users")]);
        let mut catalog = ToolCatalog::from_routes(routes);

        let added = catalog.add_bridge_tools(
            "github",
            &json!({"tools": [
                {"name": "github_get_users", "description": "remote"},
                {"name": "GitHub_search", "inputSchema": {"type": "object"}},
                {"name": "mcp_status"},
                {"description": "nameless"},
                {"name": "github_"}
            ]}),
        );
        assert_eq!(added, 3);
        assert_eq!(catalog.get("get_users").unwrap().origin, ToolOrigin::Route(0));
        assert_eq!(
            catalog.get("search").unwrap().origin,
            ToolOrigin::Bridge { provider: "github".into(), original_name: "GitHub_search".into() }
        );
        assert!(catalog.get("status").unwrap().is_bridged());
        assert!(catalog.get("github_").is_some());
        assert_eq!(catalog.get("search").unwrap().input_schema, json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn test_missing_tools_field_adds_nothing() {
        let mut catalog = ToolCatalog::default();
        assert_eq!(catalog.add_bridge_tools("echo", &json!({})), 0);
        assert!(catalog.is_empty());
        assert_eq!(catalog.to_list_result(), json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_merger_without_bridges() {
        let merger = ToolMerger::new(vec![route("GET", "/health")], None, Duration::from_secs(1));
        let (catalog, tool) = merger.resolve("get_health").await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.route(0).is_some());
        assert_eq!(tool.origin_path.as_deref(), Some("/health"));
        assert!(merger.resolve("nope").await.is_none());

        merger.set_routes(vec![route("GET", "/ready")]).await;
        assert!(merger.resolve("get_ready").await.is_some());
    }
}
