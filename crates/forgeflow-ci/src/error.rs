//! Error types for pipeline execution

use forgeflow_state::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CiError {
    #[error("Step {step} has empty command")]
    EmptyCommand { step: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step {step} timed out after {secs} seconds")]
    Timeout { step: String, secs: u64 },

    #[error("Build failed for {target}: {message}")]
    Build { target: String, message: String },

    #[error("Packaging failed: {0}")]
    Package(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Invalid target triple: {0}")]
    InvalidTarget(String),

    #[error("Unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step {0} requires a release event")]
    MissingRelease(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Job task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CiError {
    fn from(err: reqwest::Error) -> Self {
        CiError::Http(err.to_string())
    }
}

impl From<zip::result::ZipError> for CiError {
    fn from(err: zip::result::ZipError) -> Self {
        CiError::Package(err.to_string())
    }
}

/// Result type for pipeline operations
pub type CiResult<T> = std::result::Result<T, CiError>;
