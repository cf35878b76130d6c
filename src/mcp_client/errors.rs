//! MCP client error types.

use thiserror::Error;

use crate::engine::{EngineError, ImageSourceError};
use crate::store::RegistryError;

/// Errors that can occur while managing or talking to tool servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server container failed to start.
    #[error("failed to start server '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (closed stream, write failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("{message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request got no response in time.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The container stopped while a request was in flight.
    #[error("server '{server}' container is no longer running")]
    ContainerStopped { server: String },

    /// Invalid server configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Image build failed; carries the builder's own message.
    #[error("image build failed for '{name}': {reason}")]
    BuildFailed { name: String, reason: String },

    /// No live stdio session.
    #[error("connection not active for server '{server}'")]
    NotConnected { server: String },

    #[error("server not found: '{id}'")]
    ServerNotFound { id: String },

    /// A routed server published an empty tool list.
    #[error("server '{server}' has no tools available")]
    NoTools { server: String },

    /// Docker is not installed or its daemon is not reachable.
    #[error("container engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    /// An HTTP endpoint answered with a failure status.
    #[error("MCP server returned {status}: {body}")]
    HttpError { status: u16, body: String },

    /// An HTTP endpoint could not be reached.
    #[error("could not connect to '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The transport does not implement the operation.
    #[error("'{operation}' is not supported by {transport} servers")]
    Unsupported {
        operation: &'static str,
        transport: &'static str,
    },

    /// Registry failure while reading or persisting server state.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl McpError {
    /// Timeouts are the only failure a caller may sensibly retry unchanged.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<EngineError> for McpError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable { reason } => McpError::EngineUnavailable { reason },
            other => McpError::TransportError {
                server: "container engine".into(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<ImageSourceError> for McpError {
    fn from(e: ImageSourceError) -> Self {
        McpError::ConfigError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::TransportError {
            server: "json-rpc".into(),
            reason: format!("serialization failed: {e}"),
        }
    }
}
