pub mod config;
pub mod engine;
pub mod mcp_client;
pub mod redact;
pub mod secrets;
pub mod store;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use config::BridgeConfig;
use mcp_client::ToolServerBridge;

/// Number of rotated log files kept next to `bridge.log`.
const KEEP_LOGS: u32 = 3;

/// Initialize the tracing subscriber, writing to `<data_dir>/bridge.log`.
///
/// On each startup:
/// 1. Rotates existing logs (bridge.log → bridge.log.1 → .2 → .3).
/// 2. Opens a fresh bridge.log behind a line-flushing, redacting writer.
/// 3. Logs a startup banner with the data directory path.
pub fn init_tracing(data_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let log_path = data_dir.join("bridge.log");
    rotate_log_file(&log_path, KEEP_LOGS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialized: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Toolbridge starting ==="
    );
    Ok(())
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// Log writer that scrubs credentials from every line and flushes after
/// each write, so a crash never loses the tail of the log.
#[derive(Clone)]
struct RedactingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl RedactingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for RedactingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let clean = redact::redact_bytes(buf);
        let mut f = self.file.lock().map_err(|e| {
            std::io::Error::other(format!("lock poisoned: {e}"))
        })?;
        std::io::Write::write_all(&mut *f, clean.as_bytes())?;
        std::io::Write::flush(&mut *f)?;
        // The caller's bytes are consumed even though fewer may be written.
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self.file.lock().map_err(|e| {
            std::io::Error::other(format!("lock poisoned: {e}"))
        })?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingWriter {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run the bridge until Ctrl-C.
///
/// Reconciles every server and auto-starts the flagged ones, then
/// reconciles and reaps idle servers on every tick. Live stdio sessions are
/// ended on the way out.
pub async fn run() -> anyhow::Result<()> {
    let config = config::load_or_default().context("failed to load configuration")?;
    init_tracing(&config.data_dir)?;
    run_with(config).await
}

async fn run_with(config: BridgeConfig) -> anyhow::Result<()> {
    let interval = Duration::from_secs(config.reconcile_interval_secs.max(1));
    let bridge = ToolServerBridge::from_config(config).context("failed to open tool server bridge")?;

    let engine = bridge.docker_status().await;
    if engine.available {
        tracing::info!(version = engine.version.as_deref().unwrap_or("unknown"), "container engine available");
    } else {
        tracing::warn!(
            error = engine.error.as_deref().unwrap_or("unknown"),
            "container engine unavailable; Docker servers cannot start"
        );
    }

    reconcile(&bridge).await;
    match bridge.autostart().await {
        Ok(failures) if !failures.is_empty() => {
            tracing::warn!(failed = failures.len(), "some servers failed to auto-start");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "auto-start skipped"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                reconcile(&bridge).await;
                match bridge.reap_idle().await {
                    Ok(stopped) if !stopped.is_empty() => {
                        tracing::info!(count = stopped.len(), "stopped idle servers");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "idle reaping failed"),
                }
            }
        }
    }

    tracing::info!("shutting down");
    bridge.shutdown().await;
    Ok(())
}

async fn reconcile(bridge: &ToolServerBridge) {
    match bridge.lifecycle().reconcile_all().await {
        Ok(statuses) => tracing::debug!(servers = statuses.len(), "reconciled"),
        Err(e) => tracing::warn!(error = %e, "reconciliation failed"),
    }
}
