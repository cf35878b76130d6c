//! Tool-server and routing-rule records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::errors::RegistryError;
use crate::engine::image_source;

/// Default UI color for new servers.
pub const DEFAULT_COLOR: &str = "#22c55e";

/// Stored as lowercase text; round-trips through serde and SQLite with the
/// same spelling.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Self::parse(text).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} '{text}'", stringify!($name)).into(),
                    )
                })
            }
        }
    };
}

text_enum!(
    /// Where the server runs.
    ServerType { Docker => "docker", Remote => "remote" }
);

text_enum!(
    /// How a Docker server is reached. Remote servers are always HTTP.
    TransportType { Http => "http", Stdio => "stdio" }
);

text_enum!(
    /// Where a Docker server's image comes from.
    BuildSource { PrebuiltImage => "image", Dockerfile => "dockerfile" }
);

text_enum!(
    /// Cached lifecycle state. Authoritative state lives in the engine or
    /// the live session; reconciliation keeps this eventually consistent.
    ServerStatus {
        Stopped => "stopped",
        Starting => "starting",
        Building => "building",
        Running => "running",
        Error => "error",
    }
);

text_enum!(
    /// How the server was registered.
    ServerSource { Local => "local", Github => "github" }
);

// ─── Tool servers ────────────────────────────────────────────────────────────

/// A configured tool server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub server_type: ServerType,
    pub transport_type: TransportType,
    pub image: Option<String>,
    pub build_source: BuildSource,
    pub build_context: Option<String>,
    pub dockerfile_path: Option<String>,
    /// 0 for stdio and remote servers.
    pub port: u16,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Secret names resolved at start time. Values are never stored.
    pub env_var_names: Vec<String>,
    pub status: ServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub auto_start: bool,
    pub color: String,
    pub source: ServerSource,
    pub manifest_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolServerConfig {
    pub fn is_remote(&self) -> bool {
        self.server_type == ServerType::Remote
    }

    pub fn is_stdio(&self) -> bool {
        self.server_type == ServerType::Docker && self.transport_type == TransportType::Stdio
    }

    pub fn is_docker_http(&self) -> bool {
        self.server_type == ServerType::Docker && self.transport_type == TransportType::Http
    }
}

/// Editable fields of a tool server, used for create and update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewToolServer {
    pub name: String,
    pub description: Option<String>,
    pub server_type: ServerType,
    pub transport_type: TransportType,
    pub image: Option<String>,
    pub build_source: BuildSource,
    pub build_context: Option<String>,
    pub dockerfile_path: Option<String>,
    pub port: u16,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub env_var_names: Vec<String>,
    pub auto_start: bool,
    pub color: String,
    pub source: ServerSource,
    pub manifest_url: Option<String>,
}

impl Default for NewToolServer {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            server_type: ServerType::Docker,
            transport_type: TransportType::Http,
            image: None,
            build_source: BuildSource::PrebuiltImage,
            build_context: None,
            dockerfile_path: None,
            port: 0,
            url: None,
            headers: BTreeMap::new(),
            env_var_names: Vec::new(),
            auto_start: false,
            color: DEFAULT_COLOR.to_string(),
            source: ServerSource::Local,
            manifest_url: None,
        }
    }
}

impl NewToolServer {
    /// Docker server reached over HTTP on `port`.
    pub fn docker_http(name: &str, image: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
            port,
            ..Self::default()
        }
    }

    /// Docker server speaking JSON-RPC over the container's stdio.
    pub fn docker_stdio(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            transport_type: TransportType::Stdio,
            image: Some(image.to_string()),
            ..Self::default()
        }
    }

    /// Remote HTTP endpoint.
    pub fn remote(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            server_type: ServerType::Remote,
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    /// Build from a Dockerfile context instead of pulling an image.
    pub fn with_dockerfile(mut self, context: &str, dockerfile: Option<&str>) -> Self {
        self.build_source = BuildSource::Dockerfile;
        self.build_context = Some(context.to_string());
        self.dockerfile_path = dockerfile.map(str::to_string);
        self
    }

    /// Check invariants and normalize transport-dependent fields.
    pub fn validate(mut self) -> Result<Self, RegistryError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(invalid("name is required"));
        }
        self.image = non_empty(self.image);
        self.build_context = non_empty(self.build_context);
        self.dockerfile_path = non_empty(self.dockerfile_path);
        self.url = non_empty(self.url);
        self.description = non_empty(self.description);
        self.env_var_names = self
            .env_var_names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        if !is_hex_color(&self.color) {
            return Err(invalid(&format!("color '{}' is not a hex color", self.color)));
        }

        match self.server_type {
            ServerType::Remote => {
                let url = self.url.as_deref().ok_or_else(|| invalid("remote servers require a url"))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(&format!("url '{url}' must be http(s)")));
                }
                self.transport_type = TransportType::Http;
                self.port = 0;
            }
            ServerType::Docker => {
                match self.build_source {
                    BuildSource::PrebuiltImage => {
                        let image = self
                            .image
                            .as_deref()
                            .ok_or_else(|| invalid("a pre-built image name is required"))?;
                        if image.contains("://") || image.starts_with("http") {
                            return Err(invalid(&format!(
                                "image '{image}' looks like a URL; use a Dockerfile build source for repositories"
                            )));
                        }
                    }
                    BuildSource::Dockerfile => {
                        let context = self
                            .build_context
                            .as_deref()
                            .ok_or_else(|| invalid("a build context is required for Dockerfile builds"))?;
                        image_source::resolve(context, self.dockerfile_path.as_deref())
                            .map_err(|e| invalid(&e.to_string()))?;
                    }
                }
                match self.transport_type {
                    TransportType::Http if self.port == 0 => {
                        return Err(invalid("HTTP servers require a port"));
                    }
                    TransportType::Http => {}
                    TransportType::Stdio => self.port = 0,
                }
            }
        }
        Ok(self)
    }
}

fn invalid(reason: &str) -> RegistryError {
    RegistryError::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn is_hex_color(color: &str) -> bool {
    color
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

// ─── Routing rules ───────────────────────────────────────────────────────────

/// A prioritized pattern that routes prompts to one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub id: String,
    pub server_id: String,
    /// Case-insensitive regular expression.
    pub pattern: String,
    /// Higher is checked first.
    pub priority: i64,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Editable fields of a routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoutingRule {
    pub pattern: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewRoutingRule {
    pub fn new(pattern: &str, priority: i64) -> Self {
        Self {
            pattern: pattern.to_string(),
            priority,
            is_enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

// ─── Manifests ───────────────────────────────────────────────────────────────

/// Published description of an installable tool server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env_vars: Vec<String>,
    #[serde(default)]
    pub default_routing_patterns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!(ServerStatus::parse("running"), Some(ServerStatus::Running));
        assert_eq!(BuildSource::PrebuiltImage.as_str(), "image");
        assert_eq!(ServerStatus::parse("Running"), None);
        let json = serde_json::to_string(&TransportType::Stdio).unwrap();
        assert_eq!(json, "\"stdio\"");
    }

    #[test]
    fn test_stdio_prebuilt_requires_plain_image() {
        let mut server = NewToolServer::docker_stdio("github", "");
        assert!(server.clone().validate().is_err());

        server.image = Some("https://github.com/acme/mcp".into());
        let err = server.validate().unwrap_err();
        assert!(err.to_string().contains("looks like a URL"));

        let ok = NewToolServer::docker_stdio("github", "ghcr.io/acme/mcp:1")
            .validate()
            .unwrap();
        assert_eq!(ok.port, 0);
    }

    #[test]
    fn test_dockerfile_context_is_checked() {
        let bad = NewToolServer::docker_stdio("x", "")
            .with_dockerfile("https://gitlab.com/acme/mcp", None)
            .validate();
        assert!(bad.is_err());

        let ok = NewToolServer::docker_stdio("x", "")
            .with_dockerfile("https://github.com/acme/mcp", None)
            .validate()
            .unwrap();
        assert_eq!(ok.image, None);
    }

    #[test]
    fn test_remote_normalizes_transport() {
        let mut remote = NewToolServer::remote("search", "https://mcp.example.com/mcp");
        remote.transport_type = TransportType::Stdio;
        remote.port = 9000;
        let remote = remote.validate().unwrap();
        assert_eq!(remote.transport_type, TransportType::Http);
        assert_eq!(remote.port, 0);

        assert!(NewToolServer::remote("bad", "ftp://x").validate().is_err());
    }

    #[test]
    fn test_http_requires_port_and_color() {
        assert!(NewToolServer::docker_http("a", "img", 0).validate().is_err());
        let mut server = NewToolServer::docker_http("a", "img", 8011);
        server.color = "green".into();
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"name": "search", "image": "acme/search:1"}"#).unwrap();
        assert_eq!(manifest.port, None);
        assert!(manifest.default_routing_patterns.is_empty());
    }
}
