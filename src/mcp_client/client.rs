//! Tool server bridge: the high-level interface used by the assistant.
//!
//! Ties the registry, lifecycle manager, routing engine and transports
//! together. Callers route a prompt, make sure the chosen server is up, and
//! then list or call its tools without caring which transport reaches it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client as HttpClient;
use serde_json::Value;

use super::errors::McpError;
use super::lifecycle::LifecycleManager;
use super::manifest;
use super::routing::{RouteMatch, RoutingEngine};
use super::tool_format::{convert_all, ToolFormat};
use super::types::{McpToolDefinition, ToolOutput};
use crate::config::BridgeConfig;
use crate::engine::{DockerCli, EngineProvider, EngineStatus};
use crate::secrets::{EnvSecretSource, SecretSource};
use crate::store::{RoutingRule, ServerStatus, ToolServerConfig, ToolServerRegistry};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Interval between health probes while waiting for a server to come up.
const READINESS_POLL: Duration = Duration::from_millis(500);

/// Connect timeout for the bridge's own HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Prompt plan ─────────────────────────────────────────────────────────────

/// What the assistant should do with a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPlan {
    /// Call the model with the routed server's tools.
    Tools {
        server: ToolServerConfig,
        rule: RoutingRule,
        /// Tool definitions in the requested provider format.
        tools: Vec<Value>,
    },
    /// Call the model directly. `fallback_reason` is set when a routed
    /// server failed and the bridge fell back.
    Direct { fallback_reason: Option<String> },
}

// ─── ToolServerBridge ────────────────────────────────────────────────────────

pub struct ToolServerBridge {
    lifecycle: LifecycleManager,
    routing: RoutingEngine,
    http: HttpClient,
}

impl ToolServerBridge {
    pub fn new(
        registry: Arc<ToolServerRegistry>,
        engines: Arc<EngineProvider>,
        secrets: Arc<dyn SecretSource>,
        config: BridgeConfig,
    ) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        let routing = RoutingEngine::new(Arc::clone(&registry), config.mcp_enabled);
        let lifecycle = LifecycleManager::new(registry, engines, secrets, config)?;
        Ok(Self {
            lifecycle,
            routing,
            http,
        })
    }

    /// Bridge over the Docker CLI, the process environment, and the SQLite
    /// database named by `config`.
    pub fn from_config(config: BridgeConfig) -> Result<Self, McpError> {
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| McpError::ConfigError {
                reason: format!("cannot create '{}': {e}", parent.display()),
            })?;
        }
        let registry = Arc::new(open_registry(&db_path)?);
        let engines = Arc::new(EngineProvider::new(Arc::new(DockerCli::new(
            config.docker_binary.clone(),
        ))));
        Self::new(registry, engines, Arc::new(EnvSecretSource), config)
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        self.lifecycle.registry()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    pub fn config(&self) -> &BridgeConfig {
        self.lifecycle.config()
    }

    /// Container engine availability, probed once and cached.
    pub async fn docker_status(&self) -> EngineStatus {
        self.lifecycle.engines().status().await
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// Highest-priority matching rule, regardless of server state.
    pub fn match_prompt(&self, text: &str) -> Result<Option<RoutingRule>, McpError> {
        self.routing.match_rule(text)
    }

    /// Matching rule whose server can take the prompt now.
    pub fn route(&self, text: &str) -> Result<Option<RouteMatch>, McpError> {
        self.routing.route(text)
    }

    /// Decide how the assistant should answer `text`.
    ///
    /// A routed server that fails or publishes no tools is an error unless
    /// `fallback_to_llm` is set, in which case the plan is a direct call
    /// carrying the failure reason.
    pub async fn prepare_prompt(&self, text: &str, format: ToolFormat) -> Result<PromptPlan, McpError> {
        let Some(routed) = self.route(text)? else {
            return Ok(PromptPlan::Direct {
                fallback_reason: None,
            });
        };

        let result = match self.list_tools(&routed.server.id).await {
            Ok(tools) if tools.is_empty() => Err(McpError::NoTools {
                server: routed.server.name.clone(),
            }),
            other => other,
        };

        match result {
            Ok(tools) => Ok(PromptPlan::Tools {
                tools: convert_all(&tools, format),
                server: routed.server,
                rule: routed.rule,
            }),
            Err(e) if self.config().fallback_to_llm => {
                tracing::warn!(server = %routed.server.name, error = %e, "tool server failed, falling back to direct model call");
                Ok(PromptPlan::Direct {
                    fallback_reason: Some(e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start `id` unless it is already running, then (Docker/HTTP only)
    /// wait up to `wait` for its health endpoint to answer.
    pub async fn ensure_running(&self, id: &str, wait: Duration) -> Result<ToolServerConfig, McpError> {
        let server = self.registry().require(id)?;
        let observed = self
            .lifecycle
            .adapter_for(&server)
            .observe(&server)
            .await
            .unwrap_or(server.status);

        if observed != ServerStatus::Running {
            self.lifecycle.start(id).await?;
        }

        if server.is_docker_http() {
            let deadline = Instant::now() + wait;
            loop {
                let report = self.lifecycle.health_check(id).await?;
                if report.healthy {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(McpError::Timeout {
                        server: server.name.clone(),
                        method: "health".into(),
                        timeout_ms: wait.as_millis() as u64,
                    });
                }
                tokio::time::sleep(READINESS_POLL).await;
            }
        }

        self.lifecycle.touch(id);
        Ok(self.registry().require(id)?)
    }

    /// Start every server marked `autoStart`, concurrently. Returns the
    /// failures; partial startup is fine.
    pub async fn autostart(&self) -> Result<Vec<(String, McpError)>, McpError> {
        let servers: Vec<ToolServerConfig> = self
            .registry()
            .list()?
            .into_iter()
            .filter(|s| s.auto_start)
            .collect();
        if servers.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = servers.len(), "auto-starting servers");

        let results = join_all(servers.iter().map(|s| self.lifecycle.start(&s.id))).await;
        let failures: Vec<(String, McpError)> = servers
            .into_iter()
            .zip(results)
            .filter_map(|(server, result)| result.err().map(|e| (server.name, e)))
            .collect();
        for (name, e) in &failures {
            tracing::warn!(server = %name, error = %e, "auto-start failed");
        }
        Ok(failures)
    }

    /// Delete a server, stopping it first when live. Rules go with it.
    pub async fn delete_server(&self, id: &str) -> Result<(), McpError> {
        let server = self.registry().require(id)?;
        let live = matches!(server.status, ServerStatus::Running | ServerStatus::Starting);
        if live && !server.is_remote() {
            if let Err(e) = self.lifecycle.stop(id).await {
                tracing::warn!(server = %server.name, error = %e, "stop before delete failed");
            }
        }
        self.registry().delete(id)?;
        tracing::info!(server = %server.name, "server deleted");
        Ok(())
    }

    pub async fn import_manifest(&self, url: &str) -> Result<ToolServerConfig, McpError> {
        manifest::import_manifest(&self.http, self.registry(), url).await
    }

    pub async fn reap_idle(&self) -> Result<Vec<String>, McpError> {
        self.lifecycle.reap_idle().await
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    pub async fn initialize(&self, id: &str) -> Result<Value, McpError> {
        let server = self.registry().require(id)?;
        self.lifecycle.adapter_for(&server).initialize(&server).await
    }

    pub async fn list_tools(&self, id: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let server = self.registry().require(id)?;
        let tools = self.lifecycle.adapter_for(&server).list_tools(&server).await?;
        self.lifecycle.touch(id);
        tracing::debug!(server = %server.name, count = tools.len(), "listed tools");
        Ok(tools)
    }

    /// Tool list converted to a provider's function-calling format.
    pub async fn list_tools_as(&self, id: &str, format: ToolFormat) -> Result<Vec<Value>, McpError> {
        Ok(convert_all(&self.list_tools(id).await?, format))
    }

    pub async fn call_tool(&self, id: &str, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let server = self.registry().require(id)?;
        let started = Instant::now();
        let result = self
            .lifecycle
            .adapter_for(&server)
            .call_tool(&server, name, arguments)
            .await;
        self.lifecycle.touch(id);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(server = %server.name, tool = %name, elapsed_ms, "tool call succeeded"),
            Err(e) => tracing::warn!(server = %server.name, tool = %name, elapsed_ms, error = %e, "tool call failed"),
        }
        result
    }

    /// Free-form prompt processing (Docker/HTTP servers only).
    pub async fn process(&self, id: &str, input: &str, rules: &str, context: Value) -> Result<Value, McpError> {
        let server = self.registry().require(id)?;
        let result = self
            .lifecycle
            .adapter_for(&server)
            .process(&server, input, rules, context)
            .await;
        self.lifecycle.touch(id);
        result
    }

    /// Recent server output with credentials redacted.
    pub async fn fetch_logs(&self, id: &str, tail: usize) -> Result<String, McpError> {
        let server = self.registry().require(id)?;
        self.lifecycle.adapter_for(&server).fetch_logs(&server, tail).await
    }
}

fn open_registry(path: &Path) -> Result<ToolServerRegistry, McpError> {
    Ok(ToolServerRegistry::open(&path.to_string_lossy())?)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
