//! Docker containers serving HTTP on a loopback port.
//!
//! The container publishes `127.0.0.1:<port>` only. Readiness is a running
//! container plus `GET /health` answering 200; JSON-RPC goes to `/mcp` and
//! free-form prompts to `/process`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http_rpc::{map_send_error, Endpoint, HttpRpcClient};
use super::{status_from_container, HealthOutcome, StartContext, TransportAdapter};
use crate::config::{ContainerLimits, Timeouts};
use crate::engine::{http_container_name, ContainerEngine, RunSpec};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::stdio::parse_tool_list;
use crate::mcp_client::types::{HealthReport, McpToolDefinition, ToolOutput};
use crate::redact;
use crate::store::{ServerStatus, ToolServerConfig};

/// Loopback address every Docker/HTTP server is published on.
const LOOPBACK: &str = "127.0.0.1";

pub struct DockerHttpTransport {
    engine: Arc<dyn ContainerEngine>,
    rpc: Arc<HttpRpcClient>,
    prefix: String,
    limits: ContainerLimits,
    timeouts: Timeouts,
}

impl DockerHttpTransport {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        rpc: Arc<HttpRpcClient>,
        prefix: &str,
        limits: ContainerLimits,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            engine,
            rpc,
            prefix: prefix.to_string(),
            limits,
            timeouts,
        }
    }

    fn container(&self, server: &ToolServerConfig) -> String {
        http_container_name(&self.prefix, &server.name)
    }

    fn base_url(server: &ToolServerConfig) -> String {
        format!("http://{LOOPBACK}:{}", server.port)
    }

    fn rpc_url(server: &ToolServerConfig) -> String {
        format!("{}/mcp", Self::base_url(server))
    }
}

#[async_trait]
impl TransportAdapter for DockerHttpTransport {
    fn kind(&self) -> &'static str {
        "docker-http"
    }

    async fn start(&self, server: &ToolServerConfig, ctx: StartContext) -> Result<ServerStatus, McpError> {
        let container = self.container(server);
        self.engine.remove(&container).await?;
        self.rpc.forget(&server.id);

        let spec = RunSpec {
            name: container.clone(),
            image: ctx.image,
            env: ctx.env,
            port: Some(server.port),
            memory: Some(self.limits.memory.clone()),
            cpu_quota: Some(self.limits.cpu_quota),
            no_new_privileges: true,
        };
        let id = self
            .engine
            .run_detached(&spec)
            .await
            .map_err(|e| McpError::StartFailed {
                name: server.name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            server = %server.name,
            container = %container,
            container_id = %id.chars().take(12).collect::<String>(),
            port = server.port,
            "container started"
        );
        Ok(ServerStatus::Starting)
    }

    async fn stop(&self, server: &ToolServerConfig) -> Result<(), McpError> {
        let container = self.container(server);
        self.rpc.forget(&server.id);
        self.engine.stop(&container, self.timeouts.stop()).await?;
        self.engine.remove(&container).await?;
        Ok(())
    }

    async fn health_check(&self, server: &ToolServerConfig) -> HealthOutcome {
        let state = match self.engine.inspect(&self.container(server)).await {
            Ok(state) => state,
            Err(e) => {
                return HealthOutcome {
                    report: HealthReport::unhealthy(format!("Could not inspect container: {e}")),
                    status: None,
                }
            }
        };
        if !state.as_ref().is_some_and(|s| s.running) {
            return HealthOutcome {
                report: HealthReport::unhealthy("Container not running"),
                status: Some(status_from_container(state.as_ref())),
            };
        }

        let url = format!("{}/health", Self::base_url(server));
        let result = self
            .rpc
            .http()
            .get(&url)
            .timeout(self.timeouts.health())
            .send()
            .await;

        match result {
            Ok(response) if response.status().as_u16() == 200 => HealthOutcome {
                report: HealthReport::healthy(Some(200)),
                status: Some(ServerStatus::Running),
            },
            Ok(response) => {
                let code = response.status().as_u16();
                HealthOutcome {
                    report: HealthReport {
                        healthy: false,
                        reason: Some(format!("Health check returned {code}")),
                        status_code: Some(code),
                    },
                    status: None,
                }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "Health check timed out".to_string()
                } else if e.is_connect() {
                    "Could not connect to container".to_string()
                } else {
                    format!("Health check failed: {e}")
                };
                HealthOutcome {
                    report: HealthReport::unhealthy(reason),
                    status: None,
                }
            }
        }
    }

    async fn observe(&self, server: &ToolServerConfig) -> Option<ServerStatus> {
        match self.engine.inspect(&self.container(server)).await {
            Ok(state) => Some(status_from_container(state.as_ref())),
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "could not inspect container");
                None
            }
        }
    }

    async fn initialize(&self, server: &ToolServerConfig) -> Result<Value, McpError> {
        let url = Self::rpc_url(server);
        let endpoint = Endpoint {
            key: &server.id,
            url: &url,
            headers: &server.headers,
        };
        self.rpc.initialize(endpoint, self.timeouts.protocol()).await
    }

    async fn list_tools(&self, server: &ToolServerConfig) -> Result<Vec<McpToolDefinition>, McpError> {
        let url = Self::rpc_url(server);
        let endpoint = Endpoint {
            key: &server.id,
            url: &url,
            headers: &server.headers,
        };
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
        let url = Self::rpc_url(server);
        let endpoint = Endpoint {
            key: &server.id,
            url: &url,
            headers: &server.headers,
        };
        self.rpc
            .ensure_initialized(endpoint, self.timeouts.protocol())
            .await?;
        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .rpc
            .request(endpoint, "tools/call", Some(params), self.timeouts.tool_call())
            .await?;
        Ok(ToolOutput::from_result(result))
    }

    async fn fetch_logs(&self, server: &ToolServerConfig, tail: usize) -> Result<String, McpError> {
        let raw = self.engine.logs(&self.container(server), tail).await?;
        Ok(redact::redact(&raw))
    }

    async fn process(
        &self,
        server: &ToolServerConfig,
        input: &str,
        rules: &str,
        context: Value,
    ) -> Result<Value, McpError> {
        let url = format!("{}/process", Self::base_url(server));
        let timeout = self.timeouts.process();
        let body = json!({ "input": input, "rules": rules, "context": context });

        let response = self
            .rpc
            .http()
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, &url, "process", timeout))?;

        let status = response.status();
        if status.as_u16() != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::HttpError {
                status: status.as_u16(),
                body: redact::truncate_chars(&redact::redact(&text), 500),
            });
        }
        response.json::<Value>().await.map_err(|e| McpError::TransportError {
            server: server.name.clone(),
            reason: format!("invalid /process response: {e}"),
        })
    }
}
