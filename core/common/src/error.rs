//! Common error types for the Driftwood engine.

use thiserror::Error;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Network request failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Realtime transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration is invalid.
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Io(_)
                | Error::Timeout(_)
                | Error::Transport(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Timeout("probe".to_string()).is_transient());
        assert!(Error::Transport("closed".to_string()).is_transient());
        assert!(!Error::InvalidInput("bad".to_string()).is_transient());
        assert!(!Error::NotFound("task".to_string()).is_transient());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
