//! Autonomy error types
//!
//! Errors surfaced by the persistence layer. Classification, retry and health
//! bookkeeping are total and never fail.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for autonomy operations
pub type AutonomyResult<T> = Result<T, AutonomyError>;

/// Errors that can occur while loading or saving autonomy state
#[derive(Error, Debug)]
pub enum AutonomyError {
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// State file exists but could not be used
    #[error("Invalid state file {path}: {message}")]
    InvalidState { path: PathBuf, message: String },
}

impl AutonomyError {
    /// Create an invalid state error
    pub fn invalid_state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Json(_) | Self::InvalidState { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_io_is_retryable() {
        let err = AutonomyError::from(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = AutonomyError::invalid_state("/tmp/state.json", "truncated");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Invalid state file /tmp/state.json: truncated"
        );
    }
}
