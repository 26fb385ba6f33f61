//! Transport error types

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed connection URL or unsupported credential form
    #[error("invalid connection url: {0}")]
    Parse(String),

    /// Helper process failed to start or its pipes could not be created
    #[error("failed to start connection helper: {source}")]
    Spawn {
        /// The underlying spawn failure
        #[source]
        source: std::io::Error,
    },

    /// The dialed connection does not support independent half-closure
    #[error("connection does not support half-close: {0}")]
    Capability(String),

    /// A read/write/close call on an open stream failed
    ///
    /// `context` names the direction and endpoint that failed, e.g.
    /// `"copy local->remote"` or `"close-read remote"`.
    #[error("{context}: {source}")]
    Io {
        /// Direction and endpoint of the failing operation
        context: String,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Killing or reaping the helper process failed
    #[error("helper process error: {0}")]
    Process(String),
}

impl TransportError {
    /// Wrap an I/O error with the direction/endpoint that produced it.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
