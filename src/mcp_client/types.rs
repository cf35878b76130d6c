//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Notification sent after a successful `initialize`.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Fixed `initialize` payload: protocol version, no client capabilities,
/// and this crate as client info.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolbridge",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message. A request without `id` is a notification.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: None,
            id: None,
        }
    }
}

/// A decoded JSON-RPC message: a response, or a server-initiated
/// request/notification (which carries `method`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Envelope {
    /// Numeric request id, accepting ids the server echoed back as strings.
    pub fn numeric_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// True for responses (as opposed to server-initiated messages).
    ///
    /// A `"result": null` deserializes to `None`, so a response is anything
    /// with an id and no method.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Option<Value>,
}

/// Result of `tools/call`: joined text content, or the raw result when the
/// server returned no text content.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Raw(Value),
}

impl ToolOutput {
    /// Concatenate the `text` fields of a `content` array with newlines.
    pub fn from_result(result: Value) -> Self {
        let texts: Option<Vec<&str>> = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .collect()
            });
        match texts {
            Some(texts) if !texts.is_empty() => ToolOutput::Text(texts.join("\n")),
            _ => ToolOutput::Raw(result),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            ToolOutput::Text(text) => Value::String(text),
            ToolOutput::Raw(value) => value,
        }
    }
}

/// Outcome of a health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// Human-readable reason when unhealthy.
    pub reason: Option<String>,
    /// HTTP status when a probe got one.
    pub status_code: Option<u16>,
}

impl HealthReport {
    pub fn healthy(status_code: Option<u16>) -> Self {
        Self {
            healthy: true,
            reason: None,
            status_code,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
            status_code: None,
        }
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
