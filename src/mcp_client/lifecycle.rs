//! Tool server lifecycle.
//!
//! [`LifecycleManager`] drives every configured server through
//! `Stopped -> Building -> Starting -> Running -> Stopped`, with `Error`
//! reachable from any failed transition. It resolves images (building them
//! from Dockerfiles on demand), injects secrets, delegates process work to
//! the server's [`TransportAdapter`], and persists the resulting status.
//!
//! Lifecycle calls on one server are serialized by a per-server lock;
//! different servers never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use super::errors::McpError;
use super::transport::{
    DockerHttpTransport, DockerStdioTransport, HttpRpcClient, RemoteHttpTransport, StartContext,
    TransportAdapter,
};
use super::types::HealthReport;
use crate::config::BridgeConfig;
use crate::engine::{built_image_tag, image_source, BuildLogEntry, BuildRequest, ContainerEngine, EngineProvider};
use crate::redact;
use crate::secrets::{merge_names, SecretSource};
use crate::store::{BuildSource, ServerStatus, ToolServerConfig, ToolServerRegistry};

type ServerLock = Arc<tokio::sync::Mutex<()>>;

// ─── LifecycleManager ────────────────────────────────────────────────────────

pub struct LifecycleManager {
    registry: Arc<ToolServerRegistry>,
    engines: Arc<EngineProvider>,
    secrets: Arc<dyn SecretSource>,
    config: BridgeConfig,
    docker_http: DockerHttpTransport,
    docker_stdio: DockerStdioTransport,
    remote: RemoteHttpTransport,
    locks: Mutex<HashMap<String, ServerLock>>,
    last_used: Mutex<HashMap<String, Instant>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ToolServerRegistry>,
        engines: Arc<EngineProvider>,
        secrets: Arc<dyn SecretSource>,
        config: BridgeConfig,
    ) -> Result<Self, McpError> {
        let rpc = Arc::new(HttpRpcClient::new()?);
        let engine = engines.engine();
        let prefix = config.container_prefix.as_str();

        let docker_http = DockerHttpTransport::new(
            Arc::clone(&engine),
            Arc::clone(&rpc),
            prefix,
            config.limits.clone(),
            config.timeouts.clone(),
        );
        let docker_stdio =
            DockerStdioTransport::new(engine, prefix, config.limits.clone(), config.timeouts.clone());
        let remote = RemoteHttpTransport::new(rpc, config.timeouts.clone());

        Ok(Self {
            registry,
            engines,
            secrets,
            config,
            docker_http,
            docker_stdio,
            remote,
            locks: Mutex::new(HashMap::new()),
            last_used: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    pub fn engines(&self) -> &Arc<EngineProvider> {
        &self.engines
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The adapter that reaches `server`.
    pub fn adapter_for(&self, server: &ToolServerConfig) -> &dyn TransportAdapter {
        if server.is_remote() {
            &self.remote
        } else if server.is_stdio() {
            &self.docker_stdio
        } else {
            &self.docker_http
        }
    }

    fn lock_for(&self, id: &str) -> ServerLock {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn persist(&self, id: &str, status: ServerStatus) {
        if let Err(e) = self.registry.set_status(id, status, None) {
            tracing::error!(server_id = %id, status = %status, error = %e, "failed to persist status");
        }
    }

    // ─── Start / stop ────────────────────────────────────────────────────

    /// Start a server and persist the resulting status (`Running` or
    /// `Starting`). Any failure leaves the server in `Error`.
    pub async fn start(&self, id: &str) -> Result<ServerStatus, McpError> {
        let server = self.registry.require(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        tracing::info!(server = %server.name, transport = self.adapter_for(&server).kind(), "starting server");
        match self.start_locked(&server).await {
            Ok(status) => {
                self.persist(id, status);
                self.touch(id);
                tracing::info!(server = %server.name, status = %status, "server started");
                Ok(status)
            }
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "server failed to start");
                self.persist(id, ServerStatus::Error);
                Err(e)
            }
        }
    }

    async fn start_locked(&self, server: &ToolServerConfig) -> Result<ServerStatus, McpError> {
        if server.is_remote() {
            return self.remote.start(server, StartContext::default()).await;
        }

        let engine = self.engines.require().await?;
        let image = self.effective_image(server, &engine, false).await?;
        let names = merge_names(&self.config.default_env_vars, &server.env_var_names);
        let env = self.secrets.resolve(&names);
        tracing::debug!(server = %server.name, secrets = env.len(), "resolved container secrets");

        self.adapter_for(server)
            .start(server, StartContext { image, env })
            .await
    }

    /// Stop a server and persist `Stopped`. Absent containers count as
    /// already stopped.
    pub async fn stop(&self, id: &str) -> Result<(), McpError> {
        let server = self.registry.require(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(&server).await
    }

    async fn stop_locked(&self, server: &ToolServerConfig) -> Result<(), McpError> {
        if let Err(e) = self.adapter_for(server).stop(server).await {
            tracing::error!(server = %server.name, error = %e, "server failed to stop");
            return Err(e);
        }
        self.persist(&server.id, ServerStatus::Stopped);
        self.forget_use(&server.id);
        tracing::info!(server = %server.name, "server stopped");
        Ok(())
    }

    /// `stop` then `start`. A failed stop aborts the restart.
    pub async fn restart(&self, id: &str) -> Result<ServerStatus, McpError> {
        self.stop(id).await?;
        self.start(id).await
    }

    // ─── Images ──────────────────────────────────────────────────────────

    /// Rebuild a Dockerfile server's image, even if a matching one exists.
    /// Returns the built tag.
    pub async fn build_image(&self, id: &str) -> Result<String, McpError> {
        let server = self.registry.require(id)?;
        if server.is_remote() || server.build_source != BuildSource::Dockerfile {
            return Err(McpError::ConfigError {
                reason: format!("server '{}' does not build from a Dockerfile", server.name),
            });
        }
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let engine = self.engines.require().await?;
        let was_running = server.status == ServerStatus::Running;
        match self.effective_image(&server, &engine, true).await {
            Ok(tag) => {
                if !was_running {
                    self.persist(id, ServerStatus::Stopped);
                }
                Ok(tag)
            }
            Err(e) => {
                if !was_running {
                    self.persist(id, ServerStatus::Error);
                }
                Err(e)
            }
        }
    }

    /// The image to run: the configured one, or a built tag. Builds when the
    /// tag is missing or `force` is set.
    async fn effective_image(
        &self,
        server: &ToolServerConfig,
        engine: &Arc<dyn ContainerEngine>,
        force: bool,
    ) -> Result<String, McpError> {
        if server.build_source == BuildSource::PrebuiltImage {
            return server.image.clone().ok_or_else(|| McpError::ConfigError {
                reason: format!("server '{}' has no image", server.name),
            });
        }

        let context = server.build_context.as_deref().ok_or_else(|| McpError::ConfigError {
            reason: format!("server '{}' has no build context", server.name),
        })?;
        let resolved = image_source::resolve(context, server.dockerfile_path.as_deref())?;
        let tag = built_image_tag(
            &self.config.container_prefix,
            &server.name,
            &resolved.context,
            resolved.dockerfile.as_deref(),
        );

        if !force && engine.image_exists(&tag).await? {
            tracing::debug!(server = %server.name, image = %tag, "reusing built image");
            return Ok(tag);
        }

        if server.status != ServerStatus::Running {
            self.persist(&server.id, ServerStatus::Building);
        }
        tracing::info!(
            server = %server.name,
            image = %tag,
            context = %resolved.context,
            dockerfile = resolved.dockerfile.as_deref().unwrap_or("Dockerfile"),
            "building image"
        );

        let request = BuildRequest {
            tag: tag.clone(),
            context: resolved.context,
            dockerfile: resolved.dockerfile,
        };
        let mut log = engine.build_image(request).await?;
        while let Some(entry) = log.recv().await {
            match entry {
                BuildLogEntry::Output(line) => {
                    tracing::debug!(server = %server.name, line = %redact::redact(&line), "build");
                }
                BuildLogEntry::Error(message) => {
                    return Err(McpError::BuildFailed {
                        name: server.name.clone(),
                        reason: redact::redact(&message),
                    });
                }
            }
        }
        tracing::info!(server = %server.name, image = %tag, "image built");
        Ok(tag)
    }

    // ─── Health and reconciliation ───────────────────────────────────────

    /// Probe a server, persisting the corrected status and the probe time.
    ///
    /// While a lifecycle call on the server is in flight only the probe time
    /// is recorded.
    pub async fn health_check(&self, id: &str) -> Result<HealthReport, McpError> {
        let server = self.registry.require(id)?;
        let outcome = self.adapter_for(&server).health_check(&server).await;

        let lock = self.lock_for(id);
        let busy = lock.try_lock().is_err();
        let status = match outcome.status {
            Some(status) if !busy => status,
            _ => server.status,
        };
        self.registry.set_status(id, status, Some(Utc::now()))?;

        if !outcome.report.healthy {
            tracing::info!(
                server = %server.name,
                reason = outcome.report.reason.as_deref().unwrap_or(""),
                "health check failed"
            );
        }
        Ok(outcome.report)
    }

    /// Re-derive every Docker server's status from the container engine or
    /// its live session and persist it. Remote servers and servers with a
    /// lifecycle call in flight are skipped. Never starts or stops anything.
    ///
    /// Returns the status recorded for each reconciled server id.
    pub async fn reconcile_all(&self) -> Result<HashMap<String, ServerStatus>, McpError> {
        let servers = self.registry.list()?;
        let results = join_all(
            servers
                .iter()
                .filter(|s| !s.is_remote())
                .map(|server| self.reconcile_one(server)),
        )
        .await;
        Ok(results.into_iter().flatten().collect())
    }

    async fn reconcile_one(&self, server: &ToolServerConfig) -> Option<(String, ServerStatus)> {
        let lock = self.lock_for(&server.id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(server = %server.name, "lifecycle call in flight, skipping reconcile");
            return None;
        };
        let status = self.adapter_for(server).observe(server).await?;
        if status != server.status {
            tracing::info!(server = %server.name, from = %server.status, to = %status, "status reconciled");
            self.persist(&server.id, status);
        }
        Some((server.id.clone(), status))
    }

    // ─── Idle tracking ───────────────────────────────────────────────────

    /// Record a use of a server.
    pub fn touch(&self, id: &str) {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string(), Instant::now());
    }

    fn forget_use(&self, id: &str) {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    /// Stop running Docker servers unused for `idle_timeout_secs`. Returns
    /// the ids stopped. A timeout of 0 disables reaping.
    pub async fn reap_idle(&self) -> Result<Vec<String>, McpError> {
        if self.config.idle_timeout_secs == 0 {
            return Ok(Vec::new());
        }
        self.reap_idle_older_than(Duration::from_secs(self.config.idle_timeout_secs))
            .await
    }

    async fn reap_idle_older_than(&self, max_idle: Duration) -> Result<Vec<String>, McpError> {
        let servers = self.registry.list()?;
        let now = Instant::now();
        let idle: Vec<ToolServerConfig> = {
            let mut last_used = self.last_used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            servers
                .into_iter()
                .filter(|s| !s.is_remote() && s.status == ServerStatus::Running)
                .filter(|s| {
                    // Servers started before this process count from first sight.
                    let seen = *last_used.entry(s.id.clone()).or_insert(now);
                    now.duration_since(seen) >= max_idle
                })
                .collect()
        };

        let mut stopped = Vec::new();
        for server in idle {
            tracing::info!(server = %server.name, "stopping idle server");
            match self.stop(&server.id).await {
                Ok(()) => stopped.push(server.id),
                Err(e) => tracing::warn!(server = %server.name, error = %e, "failed to stop idle server"),
            }
        }
        Ok(stopped)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// End every stdio session. Their containers cannot outlive the
    /// attachment, so they are recorded as stopped.
    pub async fn shutdown(&self) {
        self.docker_stdio.shutdown_all().await;
        match self.registry.list() {
            Ok(servers) => {
                for server in servers.iter().filter(|s| s.is_stdio() && s.status != ServerStatus::Stopped) {
                    self.persist(&server.id, ServerStatus::Stopped);
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not list servers during shutdown"),
        }
        tracing::info!("lifecycle manager shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeEngine, ScriptMode};
    use crate::secrets::StaticSecrets;
    use crate::store::NewToolServer;

    struct Harness {
        engine: Arc<FakeEngine>,
        registry: Arc<ToolServerRegistry>,
        manager: LifecycleManager,
    }

    fn harness() -> Harness {
        let engine = Arc::new(FakeEngine::new());
        let registry = Arc::new(ToolServerRegistry::open(":memory:").unwrap());
        let engines = Arc::new(EngineProvider::new(engine.clone()));
        let secrets = Arc::new(StaticSecrets::default().with("OPENAI_API_KEY", "sk-live-value"));
        let mut config = BridgeConfig::default();
        config.timeouts.startup_grace_ms = 20;
        config.timeouts.protocol_secs = 5;
        config.timeouts.tool_call_secs = 5;
        let manager = LifecycleManager::new(registry.clone(), engines, secrets, config).unwrap();
        Harness {
            engine,
            registry,
            manager,
        }
    }

    fn status_of(h: &Harness, id: &str) -> ServerStatus {
        h.registry.require(id).unwrap().status
    }

    const WIDGET_URL: &str = "https://github.com/acme/widget/blob/main/docker/Dockerfile.dev";

    #[tokio::test]
    async fn test_docker_http_start_injects_secrets() {
        let h = harness();
        let mut draft = NewToolServer::docker_http("Search", "acme/search:1", 8011);
        draft.env_var_names = vec!["SEARCH_TOKEN".into()];
        let server = h.registry.create(draft).unwrap();

        let status = h.manager.start(&server.id).await.unwrap();
        assert_eq!(status, ServerStatus::Starting);
        assert_eq!(status_of(&h, &server.id), ServerStatus::Starting);

        let spec = h.engine.spec_of("toolbridge-mcp-search").unwrap();
        assert_eq!(spec.image, "acme/search:1");
        assert_eq!(spec.env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-live-value"));
        // Unresolvable names are left out rather than passed empty.
        assert!(!spec.env.contains_key("SEARCH_TOKEN"));
    }

    #[tokio::test]
    async fn test_dockerfile_build_runs_once() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_http("Widget", "", 8020).with_dockerfile(WIDGET_URL, None))
            .unwrap();

        h.manager.start(&server.id).await.unwrap();
        let builds = h.engine.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].context, "https://github.com/acme/widget.git#main:docker");
        assert_eq!(builds[0].dockerfile.as_deref(), Some("Dockerfile.dev"));
        let spec = h.engine.spec_of("toolbridge-mcp-widget").unwrap();
        assert_eq!(spec.image, builds[0].tag);

        h.manager.restart(&server.id).await.unwrap();
        assert_eq!(h.engine.builds().len(), 1);

        let tag = h.manager.build_image(&server.id).await.unwrap();
        assert_eq!(tag, builds[0].tag);
        assert_eq!(h.engine.builds().len(), 2);
    }

    #[tokio::test]
    async fn test_build_failure_sets_error() {
        let h = harness();
        h.engine.fail_builds_with("failed to solve: missing requirements.txt");
        let server = h
            .registry
            .create(NewToolServer::docker_stdio("Widget", "").with_dockerfile("./widget", None))
            .unwrap();

        let err = h.manager.start(&server.id).await.unwrap_err();
        assert!(matches!(err, McpError::BuildFailed { .. }));
        assert!(err.to_string().contains("missing requirements.txt"));
        assert_eq!(status_of(&h, &server.id), ServerStatus::Error);
        assert_eq!(h.engine.run_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_unavailable_sets_error() {
        let h = harness();
        h.engine.set_available(false);
        let server = h
            .registry
            .create(NewToolServer::docker_http("Search", "acme/search:1", 8011))
            .unwrap();

        let err = h.manager.start(&server.id).await.unwrap_err();
        assert!(matches!(err, McpError::EngineUnavailable { .. }));
        assert_eq!(status_of(&h, &server.id), ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_stdio_start_stop_cycle() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_stdio("Notes", "acme/notes:1"))
            .unwrap();

        assert_eq!(h.manager.start(&server.id).await.unwrap(), ServerStatus::Running);
        assert_eq!(status_of(&h, &server.id), ServerStatus::Running);
        assert!(h.engine.methods().contains(&"initialize".to_string()));

        h.manager.stop(&server.id).await.unwrap();
        assert_eq!(status_of(&h, &server.id), ServerStatus::Stopped);
        assert!(h.engine.container_names().is_empty());

        assert_eq!(h.manager.start(&server.id).await.unwrap(), ServerStatus::Running);
        h.manager.shutdown().await;
        assert_eq!(status_of(&h, &server.id), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_aborts_when_stop_fails() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_http("Search", "acme/search:1", 8011))
            .unwrap();
        h.manager.start(&server.id).await.unwrap();
        assert_eq!(h.engine.run_count(), 1);

        h.engine.fail_stops_with("Error response from daemon: cannot stop container");
        let err = h.manager.restart(&server.id).await.unwrap_err();
        assert!(err.to_string().contains("cannot stop container"));
        assert_eq!(h.engine.run_count(), 1);
        assert_eq!(status_of(&h, &server.id), ServerStatus::Starting);
    }

    #[tokio::test]
    async fn test_stop_clears_error_status() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_http("Search", "acme/search:1", 8011))
            .unwrap();
        h.engine.set_available(false);
        h.manager.start(&server.id).await.unwrap_err();
        assert_eq!(status_of(&h, &server.id), ServerStatus::Error);

        h.engine.set_available(true);
        h.manager.stop(&server.id).await.unwrap();
        assert_eq!(status_of(&h, &server.id), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stdio_exit_immediately_sets_error() {
        let h = harness();
        h.engine.set_mode(ScriptMode::ExitImmediately);
        let server = h
            .registry
            .create(NewToolServer::docker_stdio("Notes", "acme/notes:1"))
            .unwrap();

        let err = h.manager.start(&server.id).await.unwrap_err();
        assert!(err.to_string().contains("exited immediately"));
        assert_eq!(status_of(&h, &server.id), ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_reconcile_tracks_container_state() {
        let h = harness();
        let docker = h
            .registry
            .create(NewToolServer::docker_http("Search", "acme/search:1", 8011))
            .unwrap();
        let remote = h
            .registry
            .create(NewToolServer::remote("Hosted", "https://mcp.example.com/mcp"))
            .unwrap();
        h.registry.set_status(&remote.id, ServerStatus::Error, None).unwrap();

        h.manager.start(&docker.id).await.unwrap();
        let statuses = h.manager.reconcile_all().await.unwrap();
        assert_eq!(statuses.get(&docker.id), Some(&ServerStatus::Running));
        assert!(!statuses.contains_key(&remote.id));
        assert_eq!(status_of(&h, &remote.id), ServerStatus::Error);

        h.engine.kill("toolbridge-mcp-search");
        h.manager.reconcile_all().await.unwrap();
        assert_eq!(status_of(&h, &docker.id), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reconcile_skips_server_with_call_in_flight() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_http("Search", "acme/search:1", 8011))
            .unwrap();
        h.registry.set_status(&server.id, ServerStatus::Building, None).unwrap();

        let lock = h.manager.lock_for(&server.id);
        let guard = lock.lock().await;
        let statuses = h.manager.reconcile_all().await.unwrap();
        assert!(statuses.is_empty());
        assert_eq!(status_of(&h, &server.id), ServerStatus::Building);
        drop(guard);

        h.manager.reconcile_all().await.unwrap();
        assert_eq!(status_of(&h, &server.id), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_health_check_corrects_dead_stdio_server() {
        let h = harness();
        let server = h
            .registry
            .create(NewToolServer::docker_stdio("Notes", "acme/notes:1"))
            .unwrap();
        h.manager.start(&server.id).await.unwrap();

        let report = h.manager.health_check(&server.id).await.unwrap();
        assert!(report.healthy);

        h.engine.kill("toolbridge-mcp-stdio-notes");
        let report = h.manager.health_check(&server.id).await.unwrap();
        assert!(!report.healthy);
        let stored = h.registry.require(&server.id).unwrap();
        assert_eq!(stored.status, ServerStatus::Stopped);
        assert!(stored.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_remote_start_and_stop_only_flip_status() {
        let h = harness();
        h.engine.set_available(false);
        let server = h
            .registry
            .create(NewToolServer::remote("Hosted", "https://mcp.example.com/mcp"))
            .unwrap();

        assert_eq!(h.manager.start(&server.id).await.unwrap(), ServerStatus::Running);
        h.manager.stop(&server.id).await.unwrap();
        assert_eq!(status_of(&h, &server.id), ServerStatus::Stopped);
        assert_eq!(h.engine.run_count(), 0);
    }

    #[tokio::test]
    async fn test_reap_idle_stops_unused_docker_servers() {
        let h = harness();
        let notes = h
            .registry
            .create(NewToolServer::docker_stdio("Notes", "acme/notes:1"))
            .unwrap();
        let remote = h
            .registry
            .create(NewToolServer::remote("Hosted", "https://mcp.example.com/mcp"))
            .unwrap();
        h.manager.start(&notes.id).await.unwrap();
        h.manager.start(&remote.id).await.unwrap();

        let stopped = h.manager.reap_idle_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(stopped, vec![notes.id.clone()]);
        assert_eq!(status_of(&h, &notes.id), ServerStatus::Stopped);
        assert_eq!(status_of(&h, &remote.id), ServerStatus::Running);

        h.manager.start(&notes.id).await.unwrap();
        let stopped = h
            .manager
            .reap_idle_older_than(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(stopped.is_empty());
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let h = harness();
        let err = h.manager.start("missing").await.unwrap_err();
        assert!(matches!(err, McpError::Registry(_)));
    }
}
