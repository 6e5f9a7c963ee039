//! Error types for ASC operations

use std::path::PathBuf;

/// Result type for ASC operations
pub type Result<T> = std::result::Result<T, AscError>;

/// Error types for the ASC control plane
#[derive(Debug, thiserror::Error)]
pub enum AscError {
    /// Configuration failed to parse or validate
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file does not exist
    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// File watcher could not be created or attached
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Coordination server answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// Transport-level request failure (connect, timeout, decode)
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Retry budget exhausted; wraps the last failure
    #[error("Request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Total attempts made, including the first
        attempts: usize,
        /// Last error observed
        #[source]
        source: Box<AscError>,
    },

    /// Event stream connection or subscription failure
    #[error("Event stream error: {0}")]
    Stream(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl AscError {
    /// Permanent failures are never retried. Only client errors (4xx) qualify.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AscError::Http { status, .. } if (400..500).contains(status))
    }

    /// Status code carried by this error, looking through retry wrappers.
    pub fn status(&self) -> Option<u16> {
        match self {
            AscError::Http { status, .. } => Some(*status),
            AscError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<String> for AscError {
    fn from(s: String) -> Self {
        AscError::Other(s)
    }
}

impl From<&str> for AscError {
    fn from(s: &str) -> Self {
        AscError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for AscError {
    fn from(err: anyhow::Error) -> Self {
        AscError::Other(err.to_string())
    }
}
