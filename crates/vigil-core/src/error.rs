//! Error types shared across Vigil crates

use thiserror::Error;

/// Errors raised by the core model
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),
}
