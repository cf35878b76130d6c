//! JSON-RPC over HTTP, shared by the Docker/HTTP and Remote transports.
//!
//! Each call is one POST. Responses may be plain JSON or SSE-framed. The
//! `Mcp-Session-Id` header returned by a server is echoed on later calls to
//! the same server until the session is forgotten.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::Value;

use crate::mcp_client::codec;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{initialize_params, INITIALIZED_NOTIFICATION};
use crate::redact;

/// TCP connect timeout for every bridge HTTP call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the server-assigned MCP session.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Accept both response framings.
const ACCEPT: &str = "application/json, text/event-stream";

/// Characters of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 500;

/// Where and how to reach one server.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    /// Session key, normally the server id.
    pub key: &'a str,
    pub url: &'a str,
    pub headers: &'a BTreeMap<String, String>,
}

pub struct HttpRpcClient {
    http: HttpClient,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, String>>,
    initialized: Mutex<HashSet<String>>,
}

impl HttpRpcClient {
    pub fn new() -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            initialized: Mutex::new(HashSet::new()),
        })
    }

    /// The underlying client, for plain (non-RPC) requests.
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Send one request and return its result.
    pub async fn request(
        &self,
        endpoint: Endpoint<'_>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = codec::encode_request(method, params, id);
        let response = self.post(endpoint, body, timeout, method).await?;

        let bytes = response.bytes().await.map_err(|e| McpError::TransportError {
            server: endpoint.url.to_string(),
            reason: format!("failed to read response body: {e}"),
        })?;
        let envelope = codec::decode(&bytes).ok_or_else(|| McpError::TransportError {
            server: endpoint.url.to_string(),
            reason: format!(
                "unparsable response to '{method}': {}",
                redact::truncate_chars(&redact::redact_bytes(&bytes), MAX_ERROR_BODY)
            ),
        })?;
        codec::extract_result(envelope)
    }

    /// Send a notification. Any success status (usually 202) is accepted.
    pub async fn notify(
        &self,
        endpoint: Endpoint<'_>,
        method: &str,
        timeout: Duration,
    ) -> Result<(), McpError> {
        let body = codec::encode_notification(method);
        self.post(endpoint, body, timeout, method).await.map(|_| ())
    }

    /// `initialize` followed by the initialized notification. Notification
    /// failures are logged only.
    pub async fn initialize(&self, endpoint: Endpoint<'_>, timeout: Duration) -> Result<Value, McpError> {
        let result = self
            .request(endpoint, "initialize", Some(initialize_params()), timeout)
            .await?;
        if let Err(e) = self.notify(endpoint, INITIALIZED_NOTIFICATION, timeout).await {
            tracing::warn!(url = %endpoint.url, error = %e, "initialized notification failed");
        }
        lock(&self.initialized).insert(endpoint.key.to_string());
        Ok(result)
    }

    /// Run `initialize` unless this server was already initialized.
    pub async fn ensure_initialized(
        &self,
        endpoint: Endpoint<'_>,
        timeout: Duration,
    ) -> Result<(), McpError> {
        if lock(&self.initialized).contains(endpoint.key) {
            return Ok(());
        }
        self.initialize(endpoint, timeout).await.map(|_| ())
    }

    /// Drop the session id and initialized flag for a server.
    pub fn forget(&self, key: &str) {
        lock(&self.sessions).remove(key);
        lock(&self.initialized).remove(key);
    }

    pub fn session_id(&self, key: &str) -> Option<String> {
        lock(&self.sessions).get(key).cloned()
    }

    async fn post(
        &self,
        endpoint: Endpoint<'_>,
        body: Vec<u8>,
        timeout: Duration,
        method: &str,
    ) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .http
            .post(endpoint.url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, ACCEPT);
        for (name, value) in endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id(endpoint.key) {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| map_send_error(e, endpoint.url, method, timeout))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            lock(&self.sessions).insert(endpoint.key.to_string(), session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::HttpError {
                status: status.as_u16(),
                body: redact::truncate_chars(&redact::redact(&body), MAX_ERROR_BODY),
            });
        }
        Ok(response)
    }
}

/// Map a reqwest send failure to a timeout, a connection failure, or a
/// generic transport error.
pub(crate) fn map_send_error(
    e: reqwest::Error,
    url: &str,
    method: &str,
    timeout: Duration,
) -> McpError {
    if e.is_timeout() {
        McpError::Timeout {
            server: url.to_string(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_connect() {
        McpError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        McpError::TransportError {
            server: url.to_string(),
            reason: e.to_string(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
