//! MCP Protocol Types
//!
//! JSON-RPC 2.0 envelope types shared by every transport and by the bridge clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision announced during `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
}

/// JSON-RPC 2.0 Request (or notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate a decoded JSON value as a request envelope.
    ///
    /// On failure the returned response is the `-32600` error the caller should
    /// send back, carrying the request id when one could be recovered.
    pub fn from_value(value: Value) -> std::result::Result<Self, McpResponse> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        let Some(obj) = value.as_object() else {
            return Err(McpResponse::error(
                Value::Null,
                JsonRpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(McpResponse::error(
                id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        let method = match obj.get("method").and_then(Value::as_str) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => {
                return Err(McpResponse::error(
                    id,
                    JsonRpcError::invalid_request("method must be a non-empty string"),
                ))
            }
        };

        Ok(Self {
            jsonrpc: "2.0".to_string(),
            id: obj.get("id").filter(|v| !v.is_null()).cloned(),
            method,
            params: obj.get("params").cloned(),
        })
    }
}

/// JSON-RPC 2.0 Response
///
/// Carries exactly one of `result` / `error`; build it through [`McpResponse::success`]
/// or [`McpResponse::error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl McpResponse {
    pub fn success(id: impl Into<Option<Value>>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into().unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<Option<Value>>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into().unwrap_or(Value::Null),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    // Standard JSON-RPC error codes
    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(error_codes::PARSE_ERROR, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, msg)
    }
}

/// JSON-RPC 2.0 Notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
