//! In-memory container engine for tests.
//!
//! Containers are map entries. Attaching to one spawns a scripted MCP server
//! on the far side of a `tokio::io::duplex` pipe that answers `initialize`,
//! `tools/list` and `tools/call` the way a real stdio server would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use super::errors::EngineError;
use super::{AttachedStream, BuildLogEntry, BuildRequest, ContainerEngine, ContainerState, RunSpec};

/// How the scripted server behaves once attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// Answer requests normally.
    Normal,
    /// Exit with status 1 right after starting.
    ExitImmediately,
    /// Prefix every response with an 8-byte stream-multiplexing header.
    Framed,
}

struct FakeContainer {
    spec: RunSpec,
    state: ContainerState,
    logs: String,
    shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Recorded {
    methods: Vec<String>,
    request_ids: Vec<Value>,
    notifications: Vec<String>,
}

pub struct FakeEngine {
    available: AtomicBool,
    mode: Mutex<ScriptMode>,
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    builds: Mutex<Vec<BuildRequest>>,
    build_error: Mutex<Option<String>>,
    stop_error: Mutex<Option<String>>,
    recorded: Arc<Mutex<Recorded>>,
    run_count: Mutex<usize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            mode: Mutex::new(ScriptMode::Normal),
            images: Mutex::new(HashSet::new()),
            containers: Mutex::new(HashMap::new()),
            builds: Mutex::new(Vec::new()),
            build_error: Mutex::new(None),
            stop_error: Mutex::new(None),
            recorded: Arc::new(Mutex::new(Recorded::default())),
            run_count: Mutex::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_mode(&self, mode: ScriptMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn fail_builds_with(&self, message: &str) {
        *self.build_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_stops_with(&self, message: &str) {
        *self.stop_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        *self.run_count.lock().unwrap()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn spec_of(&self, name: &str) -> Option<RunSpec> {
        self.containers.lock().unwrap().get(name).map(|c| c.spec.clone())
    }

    /// Insert a container directly, e.g. to simulate a stale leftover.
    pub fn insert_container(&self, name: &str, state: ContainerState) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                spec: RunSpec {
                    name: name.to_string(),
                    ..RunSpec::default()
                },
                state,
                logs: String::new(),
                shutdown: None,
            },
        );
    }

    /// Simulate the container dying on its own.
    pub fn kill(&self, name: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.state = ContainerState::exited(137);
            if let Some(tx) = c.shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.recorded.lock().unwrap().methods.clone()
    }

    pub fn request_ids(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().request_ids.clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.recorded.lock().unwrap().notifications.clone()
    }

    fn no_such(name: &str) -> EngineError {
        EngineError::CommandFailed {
            command: "fake".into(),
            status: "exit status: 1".into(),
            stderr: format!("Error: No such container: {name}"),
        }
    }

    fn insert_new(&self, spec: &RunSpec, state: ContainerState) -> Result<String, EngineError> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(EngineError::CommandFailed {
                command: "fake".into(),
                status: "exit status: 125".into(),
                stderr: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                state,
                logs: String::new(),
                shutdown: None,
            },
        );
        *self.run_count.lock().unwrap() += 1;
        Ok(format!("fake-{}", spec.name))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn version(&self) -> Result<String, EngineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok("24.0.0-fake".into())
        } else {
            Err(EngineError::Unavailable {
                reason: "Cannot connect to the Docker daemon".into(),
            })
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<mpsc::Receiver<BuildLogEntry>, EngineError> {
        self.builds.lock().unwrap().push(request.clone());
        let failure = self.build_error.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(8);
        let _ = tx
            .send(BuildLogEntry::Output("#1 [internal] load build definition".into()))
            .await;
        match failure {
            Some(message) => {
                let _ = tx.send(BuildLogEntry::Error(message)).await;
            }
            None => {
                let _ = tx.send(BuildLogEntry::Output("#2 naming to image done".into())).await;
                self.add_image(&request.tag);
            }
        }
        Ok(rx)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError> {
        Ok(self.containers.lock().unwrap().get(name).map(|c| c.state.clone()))
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<String, EngineError> {
        self.insert_new(spec, ContainerState::running())
    }

    async fn create(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let state = ContainerState {
            status: "created".into(),
            running: false,
            exit_code: None,
        };
        self.insert_new(spec, state)
    }

    async fn start_attached(&self, name: &str) -> Result<AttachedStream, EngineError> {
        let mode = *self.mode.lock().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        {
            let mut containers = self.containers.lock().unwrap();
            let container = containers.get_mut(name).ok_or_else(|| Self::no_such(name))?;
            if mode == ScriptMode::ExitImmediately {
                container.state = ContainerState::exited(1);
                container.logs =
                    "Error: invalid OPENAI_API_KEY=sk-abcdefghijklmnopqrstuvwxyz0123\n".into();
            } else {
                container.state = ContainerState::running();
                container.shutdown = Some(shutdown_tx);
            }
        }

        if mode != ScriptMode::ExitImmediately {
            tokio::spawn(scripted_server(
                server,
                mode == ScriptMode::Framed,
                Arc::clone(&self.recorded),
                shutdown_rx,
            ));
        }

        let (reader, writer) = tokio::io::split(client);
        Ok(AttachedStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            attachment: None,
        })
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), EngineError> {
        if let Some(stderr) = self.stop_error.lock().unwrap().clone() {
            return Err(EngineError::CommandFailed {
                command: format!("fake stop {name}"),
                status: "exit status: 1".into(),
                stderr,
            });
        }
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.state = ContainerState::exited(0);
            if let Some(tx) = c.shutdown.take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        if let Some(mut c) = self.containers.lock().unwrap().remove(name) {
            if let Some(tx) = c.shutdown.take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    async fn logs(&self, name: &str, _tail: usize) -> Result<String, EngineError> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.logs.clone())
            .ok_or_else(|| Self::no_such(name))
    }
}

// ─── Scripted MCP server ─────────────────────────────────────────────────────

async fn scripted_server(
    stream: DuplexStream,
    framed: bool,
    recorded: Arc<Mutex<Recorded>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };

        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();

        let Some(id) = message.get("id").cloned() else {
            recorded.lock().unwrap().notifications.push(method);
            continue;
        };
        {
            let mut rec = recorded.lock().unwrap();
            rec.methods.push(method.clone());
            rec.request_ids.push(id.clone());
        }

        let reply = match method.as_str() {
            "initialize" => Some(json!({"jsonrpc": "2.0", "id": id, "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0.0.1"}
            }})),
            "tools/list" => Some(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [
                {"name": "echo", "description": "Echo text back",
                 "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}},
                {"name": "slow", "description": "Never answers"}
            ]}})),
            "tools/call" => {
                let params = &message["params"];
                match params["name"].as_str().unwrap_or_default() {
                    "slow" => None,
                    "raw" => Some(json!({"jsonrpc": "2.0", "id": id, "result": {"value": 42}})),
                    "fail" => Some(json!({"jsonrpc": "2.0", "id": id,
                        "error": {"code": -32000, "message": "tool exploded"}})),
                    _ => {
                        let text = params["arguments"]["text"].as_str().unwrap_or_default();
                        Some(json!({"jsonrpc": "2.0", "id": id, "result": {"content": [
                            {"type": "text", "text": text},
                            {"type": "text", "text": "done"}
                        ]}}))
                    }
                }
            }
            _ => Some(json!({"jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": "Method not found"}})),
        };

        let Some(reply) = reply else { continue };
        let mut bytes: Vec<u8> = Vec::new();
        // Non-protocol noise the reader must skip.
        bytes.extend_from_slice(b"fake-server: handling request\n");
        if framed {
            bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 64]);
        }
        bytes.extend_from_slice(reply.to_string().as_bytes());
        bytes.push(b'\n');
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
}
