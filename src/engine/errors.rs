//! Container engine error types.

use thiserror::Error;

/// Errors raised by a [`ContainerEngine`](super::ContainerEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine binary or daemon cannot be reached.
    #[error("container engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// An engine command ran but reported failure.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The engine process could not be spawned or its pipes failed.
    #[error("I/O error running `{command}`: {reason}")]
    Io { command: String, reason: String },

    /// Engine output was not in the expected shape.
    #[error("unexpected engine output: {reason}")]
    Parse { reason: String },
}

impl EngineError {
    /// True when the failure means "the container or image does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::CommandFailed { stderr, .. } => is_not_found_message(stderr),
            _ => false,
        }
    }
}

/// Docker and Podman phrase missing objects as "No such container/image/object".
pub(crate) fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such image")
        || lower.contains("no such object")
}

/// Errors from build-source resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageSourceError {
    /// A remote build context outside github.com.
    #[error("unsupported build context '{context}': only github.com URLs are accepted")]
    UnsupportedHost { context: String },

    /// A URL-looking context containing whitespace (usually a bad paste).
    #[error("malformed build context URL: contains whitespace")]
    MalformedUrl,

    /// Dockerfile build requested without a context.
    #[error("build context is required for Dockerfile builds")]
    MissingContext,
}
