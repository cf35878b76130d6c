//! Container engine abstraction.
//!
//! Everything the bridge needs from Docker goes through [`ContainerEngine`]:
//! run, create, attach, inspect, stop, remove, build, and logs. The
//! production implementation ([`DockerCli`]) drives the `docker` binary; tests
//! substitute an in-memory engine.
//!
//! [`EngineProvider`] is constructed once per process and shared, so
//! availability is probed once rather than at every call site.

pub mod docker_cli;
pub mod errors;
pub mod image_source;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};

pub use docker_cli::DockerCli;
pub use errors::{EngineError, ImageSourceError};
pub use image_source::{resolve, ResolvedBuild};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Live container state, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Engine status word: `created`, `running`, `exited`, ...
    pub status: String,
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

impl ContainerState {
    pub fn running() -> Self {
        Self {
            status: "running".into(),
            running: true,
            exit_code: None,
        }
    }

    pub fn exited(code: i64) -> Self {
        Self {
            status: "exited".into(),
            running: false,
            exit_code: Some(code),
        }
    }
}

/// Parameters for `run_detached` and `create`.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Resolved secret values; passed to the engine by name only.
    pub env: HashMap<String, String>,
    /// Publish `127.0.0.1:<port>:<port>`.
    pub port: Option<u16>,
    pub memory: Option<String>,
    pub cpu_quota: Option<i64>,
    pub no_new_privileges: bool,
}

/// Parameters for an image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub tag: String,
    pub context: String,
    pub dockerfile: Option<String>,
}

/// One streamed line of build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLogEntry {
    Output(String),
    Error(String),
}

/// Byte streams of an attached container.
///
/// Dropping the stream detaches; `attachment` holds whatever keeps the
/// attach session alive (the `docker start -a` child for the CLI engine).
pub struct AttachedStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub attachment: Option<tokio::process::Child>,
}

impl std::fmt::Debug for AttachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStream")
            .field("attachment", &self.attachment.as_ref().and_then(|c| c.id()))
            .finish_non_exhaustive()
    }
}

// ─── Engine trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine server version; doubles as the availability probe.
    async fn version(&self) -> Result<String, EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Start a build and stream its log. A failed build ends with at least
    /// one [`BuildLogEntry::Error`].
    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<mpsc::Receiver<BuildLogEntry>, EngineError>;

    /// `None` when no container with this name exists.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError>;

    /// Run a detached container; returns its id.
    async fn run_detached(&self, spec: &RunSpec) -> Result<String, EngineError>;

    /// Create (not start) a container with stdin kept open and no TTY.
    async fn create(&self, spec: &RunSpec) -> Result<String, EngineError>;

    /// Start a created container attached to its stdin/stdout.
    async fn start_attached(&self, name: &str) -> Result<AttachedStream, EngineError>;

    /// Absent containers are not an error.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Force-remove. Absent containers are not an error.
    async fn remove(&self, name: &str) -> Result<(), EngineError>;

    /// Last `tail` lines of combined output with timestamps, unredacted.
    async fn logs(&self, name: &str, tail: usize) -> Result<String, EngineError>;
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Cached engine availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Process-wide handle to the container engine.
pub struct EngineProvider {
    engine: Arc<dyn ContainerEngine>,
    status: RwLock<Option<EngineStatus>>,
}

impl EngineProvider {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            status: RwLock::new(None),
        }
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::clone(&self.engine)
    }

    /// Probe on first use, then serve the cached result.
    pub async fn status(&self) -> EngineStatus {
        if let Some(status) = self.status.read().await.as_ref() {
            return status.clone();
        }
        self.refresh().await
    }

    /// Re-probe, replacing the cached status.
    pub async fn refresh(&self) -> EngineStatus {
        let status = match self.engine.version().await {
            Ok(version) => EngineStatus {
                available: true,
                version: Some(version),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "container engine not available");
                EngineStatus {
                    available: false,
                    version: None,
                    error: Some(e.to_string()),
                }
            }
        };
        *self.status.write().await = Some(status.clone());
        status
    }

    /// The engine, or `Unavailable` when the probe failed. A failed cached
    /// probe is retried once, so starting Docker after the bridge recovers.
    pub async fn require(&self) -> Result<Arc<dyn ContainerEngine>, EngineError> {
        let mut status = self.status().await;
        if !status.available {
            status = self.refresh().await;
        }
        if status.available {
            Ok(self.engine())
        } else {
            Err(EngineError::Unavailable {
                reason: status.error.unwrap_or_else(|| "unknown".into()),
            })
        }
    }
}

// ─── Naming ──────────────────────────────────────────────────────────────────

/// Container-name-safe form of a server name.
pub fn normalize_name(name: &str) -> String {
    let mapped: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        "server".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Container name for a Docker/HTTP server.
pub fn http_container_name(prefix: &str, server_name: &str) -> String {
    format!("{prefix}{}", normalize_name(server_name))
}

/// Container name for a Docker/stdio server.
pub fn stdio_container_name(prefix: &str, server_name: &str) -> String {
    format!("{prefix}stdio-{}", normalize_name(server_name))
}

/// Content-addressed tag for an image built from `context` + `dockerfile`.
pub fn built_image_tag(
    prefix: &str,
    server_name: &str,
    context: &str,
    dockerfile: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update([0u8]);
    hasher.update(dockerfile.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    // Image repository names may not end in a separator.
    let name = normalize_name(server_name);
    let repo = name.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{prefix}{repo}:{hex}")
}
