//! Error types for the predictive automation core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    UpstreamTimeout { operation: String, timeout_ms: u64 },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        CoreError::Persistence(format!("storage task failed: {e}"))
    }
}

impl CoreError {
    /// True when the failure is recoverable for a single operation
    /// (the caller may retry or skip this cycle).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::UpstreamTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recoverable() {
        let err = CoreError::UpstreamTimeout {
            operation: "load_preferences".to_string(),
            timeout_ms: 5000,
        };
        assert!(err.is_recoverable());
        assert!(!CoreError::NotInitialized.is_recoverable());
    }

    #[test]
    fn test_sqlite_errors_map_to_persistence() {
        let err: CoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CoreError::Persistence(_)));
    }
}
