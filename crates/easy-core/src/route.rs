//! Local API routes exposed as tools.
//!
//! Route discovery lives outside the protocol engine. Whoever discovers the
//! routes hands over a list of [`RouteDescriptor`]s; the engine only reads
//! their metadata to build tool definitions and calls [`RouteHandler::invoke`]
//! when a client calls the tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Where a declared parameter is carried in an HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Query,
    Header,
    Path,
}

/// A declared query/header/path parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, location: ParameterLocation) -> Self {
        Self {
            name: name.into(),
            required: location == ParameterLocation::Path,
            location,
            description: None,
            schema: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// OpenAPI-style metadata attached to a route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// JSON schema of the request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    /// JSON schema of the 200 response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

/// Synthetic request handed to a route handler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteRequest {
    pub method: String,
    /// Path with parameters substituted
    pub path: String,
    pub params: Map<String, Value>,
    pub query: Map<String, Value>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Captured response of a route handler
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Value,
}

impl RouteResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Callable behind a route
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn invoke(&self, request: RouteRequest) -> anyhow::Result<RouteResponse>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnHandler<F>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RouteResponse>> + Send + 'static,
{
    async fn invoke(&self, request: RouteRequest) -> anyhow::Result<RouteResponse> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a [`RouteHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RouteResponse>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A route discovered by the API loader
#[derive(Clone)]
pub struct RouteDescriptor {
    pub method: String,
    pub path: String,
    pub metadata: RouteMetadata,
    pub handler: Arc<dyn RouteHandler>,
}

impl RouteDescriptor {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        handler: Arc<dyn RouteHandler>,
    ) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
            metadata: RouteMetadata::default(),
            handler,
        }
    }

    pub fn with_metadata(mut self, metadata: RouteMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Declared parameters carried at `location`
    pub fn parameters_in(&self, location: ParameterLocation) -> impl Iterator<Item = &ParameterSpec> {
        self.metadata
            .parameters
            .iter()
            .filter(move |p| p.location == location)
    }
}

impl fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = handler_fn(|req: RouteRequest| async move {
            Ok(RouteResponse::ok(json!({ "echo": req.body })))
        });
        let response = handler
            .invoke(RouteRequest {
                method: "POST".into(),
                path: "/echo".into(),
                body: json!({"a": 1}),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.body, json!({"echo": {"a": 1}}));
        assert!(!response.is_error());
    }

    #[test]
    fn test_parameter_spec_deserializes_openapi_shape() {
        let spec: ParameterSpec = serde_json::from_value(json!({
            "name": "limit",
            "in": "query",
            "schema": {"type": "integer"}
        }))
        .unwrap();
        assert_eq!(spec.location, ParameterLocation::Query);
        assert!(!spec.required);
        assert!(ParameterSpec::new("id", ParameterLocation::Path).required);
    }
}
