//! Transport adapters.
//!
//! Every tool server is reached through one [`TransportAdapter`], chosen by
//! its server and transport type:
//!
//! - [`DockerHttpTransport`]: a detached container serving HTTP on a loopback port.
//! - [`DockerStdioTransport`]: an interactive container speaking JSON-RPC on stdio.
//! - [`RemoteHttpTransport`]: an HTTP endpoint the bridge does not manage.
//!
//! Image builds and status persistence live in the lifecycle manager; an
//! adapter only brings its server up or down and talks to it.

pub mod docker_http;
pub mod docker_stdio;
pub mod http_rpc;
pub mod remote_http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::McpError;
use super::types::{HealthReport, McpToolDefinition, ToolOutput};
use crate::engine::ContainerState;
use crate::store::{ServerStatus, ToolServerConfig};

pub use docker_http::DockerHttpTransport;
pub use docker_stdio::DockerStdioTransport;
pub use http_rpc::HttpRpcClient;
pub use remote_http::RemoteHttpTransport;

/// Resolved inputs for starting a Docker server.
#[derive(Debug, Clone, Default)]
pub struct StartContext {
    /// Effective image: the configured one, or the freshly built tag.
    pub image: String,
    /// Resolved secret values.
    pub env: HashMap<String, String>,
}

/// Result of a health probe plus the status it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthOutcome {
    pub report: HealthReport,
    /// Status to persist; `None` leaves the cached status alone.
    pub status: Option<ServerStatus>,
}

/// Uniform capability surface over the three transports.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short label for logs and errors.
    fn kind(&self) -> &'static str;

    /// Bring the server up; returns the status to record.
    async fn start(&self, server: &ToolServerConfig, ctx: StartContext)
        -> Result<ServerStatus, McpError>;

    /// Bring the server down. Absent containers are already stopped.
    async fn stop(&self, server: &ToolServerConfig) -> Result<(), McpError>;

    async fn health_check(&self, server: &ToolServerConfig) -> HealthOutcome;

    /// Status re-derived from the external system, or `None` when
    /// reconciliation does not own this server's status.
    async fn observe(&self, server: &ToolServerConfig) -> Option<ServerStatus>;

    async fn initialize(&self, server: &ToolServerConfig) -> Result<Value, McpError>;

    async fn list_tools(&self, server: &ToolServerConfig) -> Result<Vec<McpToolDefinition>, McpError>;

    async fn call_tool(
        &self,
        server: &ToolServerConfig,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, McpError>;

    /// Recent output, already redacted.
    async fn fetch_logs(&self, server: &ToolServerConfig, tail: usize) -> Result<String, McpError>;

    /// Free-form prompt processing; `rules` are the caller's global prompt
    /// rules.
    async fn process(
        &self,
        _server: &ToolServerConfig,
        _input: &str,
        _rules: &str,
        _context: Value,
    ) -> Result<Value, McpError> {
        Err(McpError::Unsupported {
            operation: "process",
            transport: self.kind(),
        })
    }
}

/// Map an engine container state onto the cached server status.
///
/// `running` is Running, `created`/`restarting` are Starting, `dead` and
/// `removing` are Error, and everything else (including no container) is
/// Stopped.
pub fn status_from_container(state: Option<&ContainerState>) -> ServerStatus {
    let Some(state) = state else {
        return ServerStatus::Stopped;
    };
    if state.running {
        return ServerStatus::Running;
    }
    match state.status.as_str() {
        "running" => ServerStatus::Running,
        "created" | "restarting" => ServerStatus::Starting,
        "dead" | "removing" => ServerStatus::Error,
        _ => ServerStatus::Stopped,
    }
}
