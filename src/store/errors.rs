//! Registry error types.

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// A server with this name already exists.
    #[error("a server named '{name}' already exists")]
    DuplicateName { name: String },

    /// Two names that map to the same container name.
    #[error("server name '{name}' collides with existing server '{existing}'")]
    NameCollision { name: String, existing: String },

    /// No server with this id.
    #[error("server not found: '{id}'")]
    ServerNotFound { id: String },

    /// No routing rule with this id.
    #[error("routing rule not found: '{id}'")]
    RuleNotFound { id: String },

    /// The server configuration violates an invariant.
    #[error("invalid server config: {reason}")]
    InvalidConfig { reason: String },

    /// Serialization of a JSON column failed.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::SerializationError {
            reason: e.to_string(),
        }
    }
}
