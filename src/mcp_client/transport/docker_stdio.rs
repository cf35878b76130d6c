//! Docker containers speaking MCP over stdio.
//!
//! One [`StdioChannel`] per running server, keyed by server id. The session
//! map is the source of truth for liveness: a server without a live session
//! is stopped, whatever the container engine last reported.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{HealthOutcome, StartContext, TransportAdapter};
use crate::config::{ContainerLimits, Timeouts};
use crate::engine::{stdio_container_name, ContainerEngine};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::stdio::{StdioChannel, StdioLaunch};
use crate::mcp_client::types::{HealthReport, McpToolDefinition, ToolOutput};
use crate::redact;
use crate::store::{ServerStatus, ToolServerConfig};

pub struct DockerStdioTransport {
    engine: Arc<dyn ContainerEngine>,
    prefix: String,
    limits: ContainerLimits,
    timeouts: Timeouts,
    sessions: Mutex<HashMap<String, Arc<StdioChannel>>>,
}

impl DockerStdioTransport {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        prefix: &str,
        limits: ContainerLimits,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            engine,
            prefix: prefix.to_string(),
            limits,
            timeouts,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn container(&self, server: &ToolServerConfig) -> String {
        stdio_container_name(&self.prefix, &server.name)
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<StdioChannel>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self, server: &ToolServerConfig) -> Result<Arc<StdioChannel>, McpError> {
        self.sessions()
            .get(&server.id)
            .cloned()
            .ok_or_else(|| McpError::NotConnected {
                server: server.name.clone(),
            })
    }

    /// Remove `channel` from the map only if it is still the session for
    /// `id`; a start that finished in the meantime owns the slot.
    fn remove_session(&self, id: &str, channel: &Arc<StdioChannel>) -> bool {
        let mut sessions = self.sessions();
        if sessions.get(id).is_some_and(|current| Arc::ptr_eq(current, channel)) {
            sessions.remove(id);
            return true;
        }
        false
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Stop every session. Used on bridge shutdown.
    pub async fn shutdown_all(&self) {
        let channels: Vec<Arc<StdioChannel>> = self.sessions().drain().map(|(_, c)| c).collect();
        futures::future::join_all(channels.iter().map(|c| c.stop())).await;
    }
}

#[async_trait]
impl TransportAdapter for DockerStdioTransport {
    fn kind(&self) -> &'static str {
        "docker-stdio"
    }

    async fn start(&self, server: &ToolServerConfig, ctx: StartContext) -> Result<ServerStatus, McpError> {
        let previous = self.sessions().remove(&server.id);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let launch = StdioLaunch {
            server_name: server.name.clone(),
            container: self.container(server),
            image: ctx.image,
            env: ctx.env,
            memory: Some(self.limits.memory.clone()),
            cpu_quota: Some(self.limits.cpu_quota),
        };
        let channel = Arc::new(StdioChannel::start(Arc::clone(&self.engine), launch, self.timeouts.clone()).await?);

        // A server that will not handshake still counts as running; tool
        // calls retry the handshake.
        if let Err(e) = channel.initialize().await {
            tracing::warn!(server = %server.name, error = %e, "initialize failed after start");
        }

        self.sessions().insert(server.id.clone(), channel);
        Ok(ServerStatus::Running)
    }

    async fn stop(&self, server: &ToolServerConfig) -> Result<(), McpError> {
        let session = self.sessions().remove(&server.id);
        match session {
            Some(channel) => channel.stop().await,
            None => {
                let container = self.container(server);
                self.engine.stop(&container, self.timeouts.stop()).await?;
                self.engine.remove(&container).await?;
            }
        }
        Ok(())
    }

    async fn health_check(&self, server: &ToolServerConfig) -> HealthOutcome {
        let session = self.sessions().get(&server.id).cloned();
        let Some(channel) = session else {
            return HealthOutcome {
                report: HealthReport::unhealthy("No active session"),
                status: Some(ServerStatus::Stopped),
            };
        };
        if channel.is_running().await {
            return HealthOutcome {
                report: HealthReport::healthy(None),
                status: Some(ServerStatus::Running),
            };
        }

        self.remove_session(&server.id, &channel);
        channel.stop().await;
        HealthOutcome {
            report: HealthReport::unhealthy("Container not running"),
            status: Some(ServerStatus::Stopped),
        }
    }

    async fn observe(&self, server: &ToolServerConfig) -> Option<ServerStatus> {
        let session = self.sessions().get(&server.id).cloned();
        let running = match session {
            Some(channel) => channel.is_running().await,
            None => false,
        };
        Some(if running { ServerStatus::Running } else { ServerStatus::Stopped })
    }

    async fn initialize(&self, server: &ToolServerConfig) -> Result<Value, McpError> {
        self.session(server)?.initialize().await
    }

    async fn list_tools(&self, server: &ToolServerConfig) -> Result<Vec<McpToolDefinition>, McpError> {
        self.session(server)?.list_tools().await
    }

    async fn call_tool(
        &self,
        server: &ToolServerConfig,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, McpError> {
        self.session(server)?.call_tool(name, arguments).await
    }

    async fn fetch_logs(&self, server: &ToolServerConfig, tail: usize) -> Result<String, McpError> {
        let raw = self.engine.logs(&self.container(server), tail).await?;
        Ok(redact::redact(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeEngine, ScriptMode};
    use crate::store::{NewToolServer, ToolServerRegistry};
    use serde_json::json;

    fn timeouts() -> Timeouts {
        Timeouts {
            startup_grace_ms: 20,
            protocol_secs: 5,
            tool_call_secs: 5,
            ..Timeouts::default()
        }
    }

    fn transport(engine: &Arc<FakeEngine>) -> DockerStdioTransport {
        DockerStdioTransport::new(
            engine.clone(),
            "toolbridge-mcp-",
            ContainerLimits::default(),
            timeouts(),
        )
    }

    fn server() -> ToolServerConfig {
        let registry = ToolServerRegistry::open(":memory:").unwrap();
        registry
            .create(NewToolServer::docker_stdio("Notes", "acme/notes:1"))
            .unwrap()
    }

    fn ctx() -> StartContext {
        StartContext {
            image: "acme/notes:1".into(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_start_call_and_stop() {
        let engine = Arc::new(FakeEngine::new());
        let t = transport(&engine);
        let config = server();

        assert_eq!(t.start(&config, ctx()).await.unwrap(), ServerStatus::Running);
        assert_eq!(engine.container_names(), vec!["toolbridge-mcp-stdio-notes"]);
        assert_eq!(t.observe(&config).await, Some(ServerStatus::Running));

        let tools = t.list_tools(&config).await.unwrap();
        assert_eq!(tools[0].name, "echo");
        let out = t.call_tool(&config, "echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, ToolOutput::Text("hi\ndone".into()));

        t.stop(&config).await.unwrap();
        assert_eq!(t.session_count(), 0);
        assert!(engine.container_names().is_empty());
        assert_eq!(t.observe(&config).await, Some(ServerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_calls_without_session_are_not_connected() {
        let engine = Arc::new(FakeEngine::new());
        let t = transport(&engine);
        let err = t.call_tool(&server(), "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
        // Stopping a server with no session is still fine.
        t.stop(&server()).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_drops_dead_session() {
        let engine = Arc::new(FakeEngine::new());
        let t = transport(&engine);
        let config = server();
        t.start(&config, ctx()).await.unwrap();

        let healthy = t.health_check(&config).await;
        assert!(healthy.report.healthy);

        engine.kill("toolbridge-mcp-stdio-notes");
        let outcome = t.health_check(&config).await;
        assert!(!outcome.report.healthy);
        assert_eq!(outcome.status, Some(ServerStatus::Stopped));
        assert_eq!(t.session_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_session_cleanup_keeps_replacement() {
        let engine = Arc::new(FakeEngine::new());
        let t = transport(&engine);
        let config = server();
        t.start(&config, ctx()).await.unwrap();
        let stale = t.session(&config).unwrap();

        t.start(&config, ctx()).await.unwrap();
        let current = t.session(&config).unwrap();
        assert!(!Arc::ptr_eq(&stale, &current));

        // Dropping the stale session must not evict its replacement.
        assert!(!t.remove_session(&config.id, &stale));
        assert_eq!(t.session_count(), 1);
        assert!(t.health_check(&config).await.report.healthy);
        t.stop(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_session() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_mode(ScriptMode::ExitImmediately);
        let t = transport(&engine);
        let err = t.start(&server(), ctx()).await.unwrap_err();
        assert!(matches!(err, McpError::StartFailed { .. }));
        assert_eq!(t.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let engine = Arc::new(FakeEngine::new());
        let t = transport(&engine);
        t.start(&server(), ctx()).await.unwrap();
        t.shutdown_all().await;
        assert_eq!(t.session_count(), 0);
        assert!(engine.container_names().is_empty());
    }
}
