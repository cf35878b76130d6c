//! [`ContainerEngine`] backed by the `docker` command-line client.
//!
//! Each operation is one CLI invocation through `tokio::process`. Secret
//! values are placed in the child's environment and referenced with
//! `-e NAME`, so they never appear on an argument vector.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::errors::EngineError;
use super::{AttachedStream, BuildLogEntry, BuildRequest, ContainerEngine, ContainerState, RunSpec};
use crate::redact;

/// Buffered build-log entries before the builder is back-pressured.
const BUILD_LOG_CAPACITY: usize = 256;

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let sub = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        format!("{} {sub}", self.binary)
    }

    /// Run to completion and capture output.
    async fn output(&self, mut cmd: Command, args: &[&str]) -> Result<Output, EngineError> {
        cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable {
                    reason: format!("'{}' not found on PATH", self.binary),
                }
            } else {
                EngineError::Io {
                    command: self.describe(args),
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Run and return trimmed stdout, failing on a non-zero exit.
    async fn run_ok(&self, cmd: Command, args: &[&str]) -> Result<String, EngineError> {
        let out = self.output(cmd, args).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Err(EngineError::CommandFailed {
                command: self.describe(args),
                status: out.status.to_string(),
                stderr: redact::redact_bytes(&out.stderr).trim().to_string(),
            })
        }
    }

    /// Like [`run_ok`](Self::run_ok), but "no such container" is success.
    async fn run_idempotent(&self, args: &[&str]) -> Result<(), EngineError> {
        match self.run_ok(self.command(args), args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `docker run`/`docker create` arguments shared by both.
    fn container_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["--name".to_string(), spec.name.clone()];
        if let Some(port) = spec.port {
            args.push("-p".into());
            args.push(format!("127.0.0.1:{port}:{port}"));
        }
        if let Some(memory) = &spec.memory {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(quota) = spec.cpu_quota {
            args.push("--cpu-quota".into());
            args.push(quota.to_string());
        }
        if spec.no_new_privileges {
            args.push("--security-opt".into());
            args.push("no-new-privileges:true".into());
        }
        let mut names: Vec<&String> = spec.env.keys().collect();
        names.sort();
        for name in names {
            args.push("-e".into());
            args.push(name.clone());
        }
        args
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn version(&self) -> Result<String, EngineError> {
        let args = ["version", "--format", "{{.Server.Version}}"];
        self.run_ok(self.command(&args), &args)
            .await
            .map_err(|e| match e {
                EngineError::CommandFailed { stderr, .. } => EngineError::Unavailable { reason: stderr },
                other => other,
            })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        let args = ["image", "inspect", "--format", "{{.Id}}", image];
        match self.run_ok(self.command(&args), &args).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<mpsc::Receiver<BuildLogEntry>, EngineError> {
        let mut args = vec!["build", "--progress", "plain", "-t", request.tag.as_str()];
        if let Some(dockerfile) = request.dockerfile.as_deref() {
            args.push("-f");
            args.push(dockerfile);
        }
        args.push(request.context.as_str());

        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::Io {
            command: self.describe(&args),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(BUILD_LOG_CAPACITY);
        let tag = request.tag.clone();

        tokio::spawn(async move {
            let out_task = stdout.map(|s| tokio::spawn(forward_build_lines(s, tx.clone())));
            let err_task = stderr.map(|s| tokio::spawn(forward_build_lines(s, tx.clone())));

            let forwarded = async {
                let mut last_line = None;
                let mut saw_error = false;
                for task in [out_task, err_task].into_iter().flatten() {
                    if let Ok(summary) = task.await {
                        saw_error |= summary.saw_error;
                        if summary.last_line.is_some() {
                            last_line = summary.last_line;
                        }
                    }
                }
                (last_line, saw_error)
            };

            // Nobody is reading the log any more: the build was abandoned.
            let (last_line, saw_error) = tokio::select! {
                summary = forwarded => summary,
                _ = tx.closed() => {
                    tracing::info!(image = %tag, "build log dropped, cancelling build");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(image = %tag, error = %e, "failed to kill build process");
                    }
                    return;
                }
            };

            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(image = %tag, "image build finished");
                }
                Ok(status) => {
                    if !saw_error {
                        let reason = last_line
                            .unwrap_or_else(|| format!("docker build exited with {status}"));
                        let _ = tx.send(BuildLogEntry::Error(reason)).await;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(BuildLogEntry::Error(format!("failed to wait for build: {e}")))
                        .await;
                }
            }
        });

        Ok(rx)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError> {
        let args = ["container", "inspect", "--format", "{{json .State}}", name];
        match self.run_ok(self.command(&args), &args).await {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| EngineError::Parse {
                    reason: format!("container state for '{name}': {e}"),
                }),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let extra = Self::container_args(spec);
        let mut args: Vec<&str> = vec!["run", "-d"];
        args.extend(extra.iter().map(String::as_str));
        args.push(spec.image.as_str());

        let mut cmd = self.command(&args);
        cmd.envs(&spec.env);
        self.run_ok(cmd, &args).await
    }

    async fn create(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let extra = Self::container_args(spec);
        let mut args: Vec<&str> = vec!["create", "-i"];
        args.extend(extra.iter().map(String::as_str));
        args.push(spec.image.as_str());

        let mut cmd = self.command(&args);
        cmd.envs(&spec.env);
        self.run_ok(cmd, &args).await
    }

    async fn start_attached(&self, name: &str) -> Result<AttachedStream, EngineError> {
        let args = ["start", "-a", "-i", name];
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::Io {
            command: self.describe(&args),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| EngineError::Io {
            command: self.describe(&args),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Io {
            command: self.describe(&args),
            reason: "failed to capture stdout".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let container = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!(container = %container, "stderr: {}", redact::redact(&line));
                    }
                }
            });
        }

        Ok(AttachedStream {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            attachment: Some(child),
        })
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError> {
        let secs = timeout.as_secs().to_string();
        self.run_idempotent(&["stop", "-t", secs.as_str(), name]).await
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.run_idempotent(&["rm", "-f", name]).await
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, EngineError> {
        let tail = tail.to_string();
        let args = ["logs", "--tail", tail.as_str(), "--timestamps", name];
        let out = self.output(self.command(&args), &args).await?;
        if !out.status.success() {
            return Err(EngineError::CommandFailed {
                command: self.describe(&args),
                status: out.status.to_string(),
                stderr: redact::redact_bytes(&out.stderr).trim().to_string(),
            });
        }
        // The container's stderr arrives on ours; interleave both.
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(combined)
    }
}

// ─── Build log forwarding ────────────────────────────────────────────────────

struct BuildStreamSummary {
    last_line: Option<String>,
    saw_error: bool,
}

/// Forward lines to the build log; lines the builder marks as errors become
/// [`BuildLogEntry::Error`].
async fn forward_build_lines<R>(reader: R, tx: mpsc::Sender<BuildLogEntry>) -> BuildStreamSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = BuildStreamSummary {
        last_line: None,
        saw_error: false,
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = redact::redact(line.trim_end());
        if line.trim().is_empty() {
            continue;
        }
        let entry = if is_build_error_line(&line) {
            summary.saw_error = true;
            BuildLogEntry::Error(line.clone())
        } else {
            BuildLogEntry::Output(line.clone())
        };
        summary.last_line = Some(line);
        if tx.send(entry).await.is_err() {
            break;
        }
    }
    summary
}

fn is_build_error_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("ERROR:") || trimmed.starts_with("ERROR ") || trimmed.starts_with("error:")
}
