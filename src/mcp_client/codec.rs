//! JSON-RPC 2.0 encoding and decoding.
//!
//! Requests and notifications are encoded as single JSON objects. Decoding
//! accepts a bare JSON object or a Server-Sent-Events body, and returns
//! `None` for anything else: callers treat `None` as "ignore this chunk".

use serde_json::Value;

use super::errors::McpError;
use super::types::{Envelope, JsonRpcRequest};

/// SSE field prefix carrying the payload.
const SSE_DATA_PREFIX: &str = "data:";

/// Encode a request: `{"jsonrpc":"2.0","method":..,"params":..,"id":..}`.
/// `params` is omitted when `None`.
pub fn encode_request(method: &str, params: Option<Value>, id: u64) -> Vec<u8> {
    encode(&JsonRpcRequest::new(id, method, params))
}

/// Encode a notification: a request without `id`.
pub fn encode_notification(method: &str) -> Vec<u8> {
    encode(&JsonRpcRequest::notification(method))
}

fn encode(request: &JsonRpcRequest) -> Vec<u8> {
    // Every field is a string, number, or `Value`, so this cannot fail.
    serde_json::to_vec(request).unwrap_or_default()
}

/// Decode a response body: bare JSON, or SSE where the first `data:` line
/// holding a JSON object wins.
pub fn decode(bytes: &[u8]) -> Option<Envelope> {
    let text = std::str::from_utf8(bytes).ok()?;
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(trimmed) {
            return Some(envelope);
        }
    }

    text.lines()
        .filter_map(|line| line.trim_start().strip_prefix(SSE_DATA_PREFIX))
        .map(str::trim)
        .filter(|payload| payload.starts_with('{'))
        .find_map(|payload| serde_json::from_str::<Envelope>(payload).ok())
}

/// Decode one line read from a container stream, skipping any framing bytes
/// before the first `{`.
pub fn decode_stream_line(line: &[u8]) -> Option<Envelope> {
    let start = line.iter().position(|b| *b == b'{')?;
    let payload = &line[start..];
    let payload = match payload.last() {
        Some(b'\r') => &payload[..payload.len() - 1],
        _ => payload,
    };
    serde_json::from_slice::<Envelope>(payload).ok()
}

/// Turn a response envelope into its result, mapping JSON-RPC errors to
/// [`McpError::ServerError`].
pub fn extract_result(envelope: Envelope) -> Result<Value, McpError> {
    if let Some(err) = envelope.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(envelope.result.unwrap_or(Value::Null))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
