//! Import of published tool-server manifests.
//!
//! A manifest is a small JSON document (usually a raw GitHub URL) naming an
//! image, a preferred port, the secrets the server needs, and default routing
//! patterns.

use std::time::Duration;

use reqwest::Client as HttpClient;

use super::errors::McpError;
use crate::redact;
use crate::store::{Manifest, ToolServerConfig, ToolServerRegistry};

/// Manifest downloads are small; anything slower is treated as a failure.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Download and parse a manifest. `name` and `image` are required.
pub async fn fetch_manifest(http: &HttpClient, url: &str) -> Result<Manifest, McpError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(McpError::ConfigError {
            reason: format!("manifest url '{url}' must be http(s)"),
        });
    }

    let response = http
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| super::transport::http_rpc::map_send_error(e, url, "manifest", FETCH_TIMEOUT))?;

    let status = response.status();
    if status.as_u16() != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::HttpError {
            status: status.as_u16(),
            body: redact::truncate_chars(&redact::redact(&body), 200),
        });
    }

    let bytes = response.bytes().await.map_err(|e| McpError::TransportError {
        server: url.to_string(),
        reason: format!("failed to read manifest: {e}"),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| McpError::ConfigError {
        reason: format!("invalid manifest: {e}"),
    })
}

/// Fetch a manifest and register its server and default rules.
pub async fn import_manifest(
    http: &HttpClient,
    registry: &ToolServerRegistry,
    url: &str,
) -> Result<ToolServerConfig, McpError> {
    let manifest = fetch_manifest(http, url).await?;
    Ok(registry.import_manifest(&manifest, url)?)
}
