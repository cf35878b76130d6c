//! Bridge configuration loading and validation.
//!
//! Reads `config.yaml` (or `$TOOLBRIDGE_CONFIG`) and resolves environment
//! variables. Every field has a default applied once at load time, so the
//! rest of the crate never has to guess at a missing setting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// The only configuration layout this build understands.
pub const CONFIG_VERSION: u32 = 1;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLBRIDGE_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur while loading the bridge configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// The YAML could not be parsed into a `BridgeConfig`.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds a value the bridge cannot work with.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Resource limits applied to Docker/HTTP containers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerLimits {
    /// Docker memory limit (e.g. `512m`).
    pub memory: String,
    /// CFS quota in microseconds per 100ms period (`50000` = half a CPU).
    pub cpu_quota: i64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory: "512m".to_string(),
            cpu_quota: 50_000,
        }
    }
}

/// Timeouts for protocol calls, health probes, and container teardown.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// `initialize` and `tools/list`.
    pub protocol_secs: u64,
    /// `tools/call`.
    pub tool_call_secs: u64,
    /// Docker/HTTP `/health` probe.
    pub health_secs: u64,
    /// Remote endpoint liveness probe.
    pub remote_health_secs: u64,
    /// Free-form `/process` requests.
    pub process_secs: u64,
    /// Grace period before checking that a stdio container stayed up.
    pub startup_grace_ms: u64,
    /// Seconds `docker stop` waits before killing.
    pub stop_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            protocol_secs: 30,
            tool_call_secs: 120,
            health_secs: 5,
            remote_health_secs: 10,
            process_secs: 60,
            startup_grace_ms: 1_000,
            stop_secs: 10,
        }
    }
}

impl Timeouts {
    pub fn protocol(&self) -> Duration {
        Duration::from_secs(self.protocol_secs)
    }

    pub fn tool_call(&self) -> Duration {
        Duration::from_secs(self.tool_call_secs)
    }

    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }

    pub fn remote_health(&self) -> Duration {
        Duration::from_secs(self.remote_health_secs)
    }

    pub fn process(&self) -> Duration {
        Duration::from_secs(self.process_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }
}

/// Top-level bridge configuration (mirrors `config.yaml`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Layout version; must equal [`CONFIG_VERSION`].
    pub version: u32,
    /// Directory for the database and log files.
    pub data_dir: PathBuf,
    /// SQLite database path. Defaults to `<data_dir>/toolbridge.db`.
    pub database_path: Option<PathBuf>,
    /// Container engine CLI.
    pub docker_binary: String,
    /// Prefix for every container and built image the bridge owns.
    pub container_prefix: String,
    /// Master switch for prompt routing.
    pub mcp_enabled: bool,
    /// When a routed tool server fails, fall back to a direct model call
    /// instead of surfacing the error.
    pub fallback_to_llm: bool,
    /// Seconds of inactivity before an idle container may be reclaimed.
    pub idle_timeout_secs: u64,
    /// Interval of the background status reconciliation in the binary.
    pub reconcile_interval_secs: u64,
    /// Secret names injected into every Docker server in addition to the
    /// server's own list.
    pub default_env_vars: Vec<String>,
    pub limits: ContainerLimits,
    pub timeouts: Timeouts,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            data_dir: default_data_dir(),
            database_path: None,
            docker_binary: "docker".to_string(),
            container_prefix: "toolbridge-mcp-".to_string(),
            mcp_enabled: true,
            fallback_to_llm: true,
            idle_timeout_secs: 300,
            reconcile_interval_secs: 30,
            default_env_vars: vec![
                "OPENAI_API_KEY".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "GEMINI_API_KEY".to_string(),
            ],
            limits: ContainerLimits::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl BridgeConfig {
    /// Effective SQLite database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("toolbridge.db"))
    }

    /// Reject values that would produce broken containers or busy loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "unsupported config version {} (expected {CONFIG_VERSION})",
                    self.version
                ),
            });
        }
        if self.container_prefix.is_empty()
            || !self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
        {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "container_prefix '{}' must be lowercase [a-z0-9_.-]",
                    self.container_prefix
                ),
            });
        }
        if self.docker_binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "docker_binary must not be empty".into(),
            });
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "reconcile_interval_secs must be positive".into(),
            });
        }
        if self.timeouts.protocol_secs == 0 || self.timeouts.tool_call_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "protocol and tool-call timeouts must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Platform data directory for the bridge.
///
/// Falls back to `~/.toolbridge/` when no platform directory resolves.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file: `$TOOLBRIDGE_CONFIG` first, then
/// `<data_dir>/config.yaml`. Returns `None` when neither exists.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let candidate = default_data_dir().join("config.yaml");
    candidate.exists().then_some(candidate)
}

/// Load the configuration, falling back to defaults when no file exists.
pub fn load_or_default() -> Result<BridgeConfig, ConfigError> {
    match find_config_path() {
        Some(path) => load_config(&path),
        None => Ok(BridgeConfig::default()),
    }
}

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse configuration text. Empty input yields the defaults.
pub fn parse_config(raw: &str) -> Result<BridgeConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    let mut config: BridgeConfig = if interpolated.trim().is_empty() {
        BridgeConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?
    };

    config.data_dir = PathBuf::from(expand_tilde(&config.data_dir.to_string_lossy()));
    if let Some(db) = &config.database_path {
        config.database_path = Some(PathBuf::from(expand_tilde(&db.to_string_lossy())));
    }

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config.container_prefix, "toolbridge-mcp-");
        assert_eq!(config.limits.memory, "512m");
        assert_eq!(config.limits.cpu_quota, 50_000);
        assert!(config.timeouts.tool_call_secs > config.timeouts.protocol_secs);
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let yaml = r#"
            fallback_to_llm: false
            timeouts:
              tool_call_secs: 300
        "#;
        let config = parse_config(yaml).unwrap();
        assert!(!config.fallback_to_llm);
        assert!(config.mcp_enabled);
        assert_eq!(config.timeouts.tool_call_secs, 300);
        assert_eq!(config.timeouts.protocol_secs, 30);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = parse_config("version: 7").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_bad_prefix_rejected() {
        let err = parse_config("container_prefix: \"Bad Prefix\"").unwrap_err();
        assert!(err.to_string().contains("container_prefix"));
    }

    #[test]
    fn test_interpolation_with_default() {
        std::env::remove_var("__TOOLBRIDGE_TEST_MISSING__");
        let yaml = "data_dir: \"${__TOOLBRIDGE_TEST_MISSING__:-/srv/toolbridge}\"";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/toolbridge"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/toolbridge/toolbridge.db"));
    }

    #[test]
    fn test_interpolation_with_value() {
        std::env::set_var("__TOOLBRIDGE_TEST_DOCKER__", "podman");
        let config = parse_config("docker_binary: \"${__TOOLBRIDGE_TEST_DOCKER__}\"").unwrap();
        assert_eq!(config.docker_binary, "podman");
        std::env::remove_var("__TOOLBRIDGE_TEST_DOCKER__");
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "mcp_enabled: false\nidle_timeout_secs: 600\n").unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.mcp_enabled);
        assert_eq!(config.idle_timeout_secs, 600);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = load_config(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/toolbridge");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/toolbridge"));
    }
}
