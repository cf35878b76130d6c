//! Remote HTTP tool servers.
//!
//! The bridge does not manage these: start and stop only flip the cached
//! status, and liveness is whatever a GET on the configured URL says.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::http_rpc::{Endpoint, HttpRpcClient};
use super::{HealthOutcome, StartContext, TransportAdapter};
use crate::config::Timeouts;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::stdio::parse_tool_list;
use crate::mcp_client::types::{HealthReport, McpToolDefinition, ToolOutput};
use crate::store::{ServerStatus, ToolServerConfig};

pub struct RemoteHttpTransport {
    rpc: Arc<HttpRpcClient>,
    timeouts: Timeouts,
}

impl RemoteHttpTransport {
    pub fn new(rpc: Arc<HttpRpcClient>, timeouts: Timeouts) -> Self {
        Self { rpc, timeouts }
    }

    fn endpoint<'a>(server: &'a ToolServerConfig) -> Result<Endpoint<'a>, McpError> {
        let url = server.url.as_deref().ok_or_else(|| McpError::ConfigError {
            reason: format!("remote server '{}' has no url", server.name),
        })?;
        Ok(Endpoint {
            key: &server.id,
            url,
            headers: &server.headers,
        })
    }
}

#[async_trait]
impl TransportAdapter for RemoteHttpTransport {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn start(
        &self,
        server: &ToolServerConfig,
        _ctx: StartContext,
    ) -> Result<ServerStatus, McpError> {
        Self::endpoint(server)?;
        Ok(ServerStatus::Running)
    }

    async fn stop(&self, server: &ToolServerConfig) -> Result<(), McpError> {
        self.rpc.forget(&server.id);
        Ok(())
    }

    /// Any response below 500 counts as alive; MCP endpoints often 404 or
    /// 405 on a bare GET.
    async fn health_check(&self, server: &ToolServerConfig) -> HealthOutcome {
        let endpoint = match Self::endpoint(server) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return HealthOutcome {
                    report: HealthReport::unhealthy(e.to_string()),
                    status: Some(ServerStatus::Error),
                }
            }
        };

        let mut request = self
            .rpc
            .http()
            .get(endpoint.url)
            .timeout(self.timeouts.remote_health());
        for (name, value) in endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let report = match request.send().await {
            Ok(response) if response.status().as_u16() < 500 => {
                HealthReport::healthy(Some(response.status().as_u16()))
            }
            Ok(response) => {
                let code = response.status().as_u16();
                HealthReport {
                    healthy: false,
                    reason: Some(format!("Server returned {code}")),
                    status_code: Some(code),
                }
            }
            Err(e) if e.is_timeout() => HealthReport::unhealthy("Health check timed out"),
            Err(e) if e.is_connect() => HealthReport::unhealthy("Could not connect to server"),
            Err(e) => HealthReport::unhealthy(format!("Health check failed: {e}")),
        };

        // A server the user stopped stays stopped whatever the probe says.
        let status = match (server.status, report.healthy) {
            (ServerStatus::Stopped, _) => None,
            (_, true) => Some(ServerStatus::Running),
            (_, false) => Some(ServerStatus::Error),
        };
        HealthOutcome { report, status }
    }

    async fn observe(&self, _server: &ToolServerConfig) -> Option<ServerStatus> {
        None
    }

    async fn initialize(&self, server: &ToolServerConfig) -> Result<Value, McpError> {
        self.rpc
            .initialize(Self::endpoint(server)?, self.timeouts.protocol())
            .await
    }

    async fn list_tools(&self, server: &ToolServerConfig) -> Result<Vec<McpToolDefinition>, McpError> {
        let endpoint = Self::endpoint(server)?;
        self.rpc
            .ensure_initialized(endpoint, self.timeouts.protocol())
            .await?;
        let result = self
            .rpc
            .request(endpoint, "tools/list", None, self.timeouts.protocol())
            .await?;
        Ok(parse_tool_list(&server.name, &result))
    }

    async fn call_tool(
        &self,
        server: &ToolServerConfig,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, McpError> {
        let endpoint = Self::endpoint(server)?;
        self.rpc
            .ensure_initialized(endpoint, self.timeouts.protocol())
            .await?;
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self
            .rpc
            .request(endpoint, "tools/call", Some(params), self.timeouts.tool_call())
            .await?;
        Ok(ToolOutput::from_result(result))
    }

    async fn fetch_logs(&self, _server: &ToolServerConfig, _tail: usize) -> Result<String, McpError> {
        Err(McpError::Unsupported {
            operation: "fetch_logs",
            transport: self.kind(),
        })
    }
}
