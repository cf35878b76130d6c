//! Persistent store for tool-server configurations and routing rules.
//!
//! Backed by SQLite through `rusqlite`. Names are unique, and deleting a
//! server cascades to its rules through a foreign key.

pub mod errors;
pub mod registry;
pub mod types;

pub use errors::RegistryError;
pub use registry::ToolServerRegistry;
pub use types::{
    BuildSource, Manifest, NewRoutingRule, NewToolServer, RoutingRule, ServerSource, ServerStatus,
    ServerType, ToolServerConfig, TransportType,
};
