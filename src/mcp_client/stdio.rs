//! JSON-RPC over an interactive container's stdio.
//!
//! One [`StdioChannel`] owns one container started with stdin open and no
//! TTY. A background reader task splits the attached output on newlines and
//! hands every response to the caller waiting on its id; callers wait on a
//! per-request oneshot, a deadline, and a periodic liveness probe of the
//! container, whichever fires first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::codec;
use super::errors::McpError;
use super::types::{initialize_params, Envelope, McpToolDefinition, ToolOutput, INITIALIZED_NOTIFICATION};
use crate::config::Timeouts;
use crate::engine::{ContainerEngine, RunSpec};
use crate::redact;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How often a waiting caller re-checks that the container is alive.
const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Characters of container output kept in a start-failure message.
const MAX_FAILURE_OUTPUT: usize = 500;

/// Log lines fetched when a container exits during startup.
const FAILURE_LOG_TAIL: usize = 100;

/// An unterminated line longer than this is discarded.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

// ─── Launch parameters ───────────────────────────────────────────────────────

/// What to run for a stdio session.
#[derive(Debug, Clone)]
pub struct StdioLaunch {
    /// Display name for logs and errors.
    pub server_name: String,
    pub container: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub memory: Option<String>,
    pub cpu_quota: Option<i64>,
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// A live stdio session with one container.
pub struct StdioChannel {
    server: String,
    container: String,
    engine: Arc<dyn ContainerEngine>,
    timeouts: Timeouts,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    attachment: tokio::sync::Mutex<Option<tokio::process::Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    initialized: AtomicBool,
    /// Held across the handshake so concurrent first calls send one `initialize`.
    init_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioChannel {
    /// Create and attach to a fresh container, then confirm it survived the
    /// startup grace period.
    ///
    /// A same-named leftover container is removed first. If the container
    /// exits during the grace period, the error carries its (redacted,
    /// truncated) output.
    pub async fn start(
        engine: Arc<dyn ContainerEngine>,
        launch: StdioLaunch,
        timeouts: Timeouts,
    ) -> Result<Self, McpError> {
        let name = launch.server_name.clone();
        let start_failed = |reason: String| McpError::StartFailed {
            name: name.clone(),
            reason,
        };

        engine
            .remove(&launch.container)
            .await
            .map_err(|e| start_failed(format!("could not remove stale container: {e}")))?;

        let spec = RunSpec {
            name: launch.container.clone(),
            image: launch.image.clone(),
            env: launch.env,
            port: None,
            memory: launch.memory,
            cpu_quota: launch.cpu_quota,
            no_new_privileges: true,
        };
        engine
            .create(&spec)
            .await
            .map_err(|e| start_failed(e.to_string()))?;

        let stream = match engine.start_attached(&launch.container).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = engine.remove(&launch.container).await;
                return Err(start_failed(e.to_string()));
            }
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            launch.server_name.clone(),
            stream.reader,
            Arc::clone(&pending),
            Arc::clone(&running),
            shutdown_rx,
        ));

        let channel = Self {
            server: launch.server_name,
            container: launch.container,
            engine,
            timeouts,
            writer: tokio::sync::Mutex::new(Some(stream.writer)),
            attachment: tokio::sync::Mutex::new(stream.attachment),
            pending,
            next_id: AtomicU64::new(1),
            running,
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            shutdown: shutdown_tx,
            reader: Mutex::new(Some(reader)),
        };

        tokio::time::sleep(channel.timeouts.startup_grace()).await;

        let state = channel.engine.inspect(&channel.container).await.ok().flatten();
        if let Some(state) = state.filter(|s| s.running) {
            tracing::info!(
                server = %channel.server,
                container = %channel.container,
                status = %state.status,
                "stdio session started"
            );
            return Ok(channel);
        }

        let output = channel.captured_output().await;
        channel.stop().await;
        Err(start_failed(format!(
            "container exited immediately: {}",
            if output.is_empty() { "(no output)" } else { output.as_str() }
        )))
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    /// Live status from the engine; the session flag alone is not trusted.
    pub async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.container_running().await
    }

    async fn container_running(&self) -> bool {
        match self.engine.inspect(&self.container).await {
            Ok(Some(state)) => state.running,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(container = %self.container, error = %e, "inspect failed");
                false
            }
        }
    }

    async fn captured_output(&self) -> String {
        match self.engine.logs(&self.container, FAILURE_LOG_TAIL).await {
            Ok(raw) => redact::truncate_chars(redact::redact(raw.trim()).as_str(), MAX_FAILURE_OUTPUT),
            Err(e) => {
                tracing::debug!(container = %self.container, error = %e, "no logs for failed container");
                String::new()
            }
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request and wait for its response, the timeout, or the
    /// container stopping.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(McpError::NotConnected {
                server: self.server.clone(),
            });
        }

        let (id, mut rx) = {
            let mut pending = self.lock_pending();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            (id, rx)
        };

        let mut bytes = codec::encode_request(method, params, id);
        bytes.push(b'\n');
        if let Err(e) = self.write(&bytes).await {
            self.forget(id);
            return Err(e);
        }
        tracing::debug!(server = %self.server, id, method, "request sent");

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut liveness = tokio::time::interval(LIVENESS_POLL);
        liveness.tick().await;

        loop {
            tokio::select! {
                response = &mut rx => {
                    return match response {
                        Ok(envelope) => codec::extract_result(envelope),
                        Err(_) => Err(McpError::ContainerStopped { server: self.server.clone() }),
                    };
                }
                _ = &mut deadline => {
                    self.forget(id);
                    tracing::warn!(server = %self.server, id, method, "request timed out");
                    return Err(McpError::Timeout {
                        server: self.server.clone(),
                        method: method.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                _ = liveness.tick() => {
                    if !self.running.load(Ordering::SeqCst) || !self.container_running().await {
                        self.forget(id);
                        return Err(McpError::ContainerStopped { server: self.server.clone() });
                    }
                }
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str) -> Result<(), McpError> {
        let mut bytes = codec::encode_notification(method);
        bytes.push(b'\n');
        self.write(&bytes).await
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::NotConnected {
            server: self.server.clone(),
        })?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| McpError::TransportError {
            server: self.server.clone(),
            reason: format!("failed to write to container stdin: {e}"),
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Envelope>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop a pending id so a late response is discarded.
    fn forget(&self, id: u64) {
        self.lock_pending().remove(&id);
    }

    // ─── MCP protocol ────────────────────────────────────────────────────

    /// Run the `initialize` handshake once. Repeated calls return
    /// `{"already_initialized": true}` without sending anything.
    pub async fn initialize(&self) -> Result<Value, McpError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(json!({ "already_initialized": true }));
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(json!({ "already_initialized": true }));
        }

        let result = self
            .send("initialize", Some(initialize_params()), self.timeouts.protocol())
            .await?;

        if let Err(e) = self.notify(INITIALIZED_NOTIFICATION).await {
            tracing::warn!(server = %self.server, error = %e, "failed to send initialized notification");
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.initialize().await?;
        let result = self
            .send("tools/list", None, self.timeouts.protocol())
            .await?;
        Ok(parse_tool_list(&self.server, &result))
    }

    /// `tools/call` with the longer tool-execution timeout.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        self.initialize().await?;
        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .send("tools/call", Some(params), self.timeouts.tool_call())
            .await?;
        Ok(ToolOutput::from_result(result))
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Tear the session down. Never fails; teardown errors are logged.
    ///
    /// The session is marked stopped before anything else so in-flight
    /// requests fail immediately.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        self.lock_pending().clear();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reader {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                tracing::warn!(server = %self.server, "reader task did not exit in time");
            }
        }

        if let Some(mut child) = self.attachment.lock().await.take() {
            let _ = child.kill().await;
        }

        if let Err(e) = self.engine.stop(&self.container, self.timeouts.stop()).await {
            tracing::warn!(container = %self.container, error = %e, "failed to stop container");
        }
        if let Err(e) = self.engine.remove(&self.container).await {
            tracing::warn!(container = %self.container, error = %e, "failed to remove container");
        }
        tracing::info!(server = %self.server, "stdio session stopped");
    }
}

/// Pull tool definitions out of a `tools/list` result. Malformed entries
/// are skipped.
pub(crate) fn parse_tool_list(server: &str, result: &Value) -> Vec<McpToolDefinition> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| match serde_json::from_value(tool.clone()) {
                    Ok(def) => Some(def),
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "skipping malformed tool definition");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

// ─── Reader loop ─────────────────────────────────────────────────────────────

async fn read_loop(
    server: String,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    pending: PendingMap,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];

    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => {
                tracing::info!(server = %server, "container stream closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "container stream read failed");
                break;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            dispatch_line(&server, &line[..line.len() - 1], &pending);
        }
        if buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(server = %server, bytes = buffer.len(), "discarding oversized line");
            buffer.clear();
        }
    }

    running.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter.
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

fn dispatch_line(server: &str, line: &[u8], pending: &PendingMap) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    match codec::decode_stream_line(line) {
        Some(envelope) if envelope.is_response() => {
            let Some(id) = envelope.numeric_id() else {
                tracing::debug!(server = %server, "response without usable id");
                return;
            };
            let waiter = pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => tracing::debug!(server = %server, id, "discarding late or unknown response"),
            }
        }
        Some(envelope) => {
            tracing::debug!(
                server = %server,
                method = envelope.method.as_deref().unwrap_or(""),
                "ignoring server-initiated message"
            );
        }
        None => {
            let text = redact::truncate_chars(&redact::redact_bytes(line), 200);
            tracing::debug!(server = %server, output = %text, "non-protocol output");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
