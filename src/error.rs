//! Error types for bricking operations

use thiserror::Error;

/// Main error type for partitioning, curving and apportionment
#[derive(Error, Debug)]
pub enum BrickError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("No volume loaded")]
    NoVolumeLoaded,

    #[error("Source read error: {0}")]
    SourceRead(String),

    #[error("Compute backend error: {0}")]
    ComputeBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Addressing invariant violated: {0}")]
    AddressingInvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Specialized Result type for bricking operations
pub type Result<T> = std::result::Result<T, BrickError>;

impl From<serde_json::Error> for BrickError {
    fn from(err: serde_json::Error) -> Self {
        BrickError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for BrickError {
    fn from(err: image::ImageError) -> Self {
        BrickError::SourceRead(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BrickError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrickError::ComputeBackend(format!("worker task failed: {}", err))
    }
}
