//! MCP client: tool server transports, lifecycle and routing.
//!
//! This module handles:
//! - JSON-RPC 2.0 framing over HTTP bodies and raw container streams
//! - Interactive stdio sessions with Docker containers
//! - Docker/HTTP, Docker/stdio and remote transports behind one trait
//! - Build, start, stop, health and reconciliation of configured servers
//! - Routing free-text prompts to at most one server
//!
//! [`ToolServerBridge`] is the entry point used by the assistant.

pub mod client;
pub mod codec;
pub mod errors;
pub mod lifecycle;
pub mod manifest;
pub mod routing;
pub mod stdio;
pub mod tool_format;
pub mod transport;
pub mod types;

pub use client::{PromptPlan, ToolServerBridge};
pub use errors::McpError;
pub use lifecycle::LifecycleManager;
pub use routing::{RouteMatch, RoutingEngine};
pub use stdio::StdioChannel;
pub use tool_format::ToolFormat;
pub use transport::TransportAdapter;
pub use types::{HealthReport, McpToolDefinition, ToolOutput};
