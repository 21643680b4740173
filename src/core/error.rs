//! Error types for voxmesh

use thiserror::Error;

/// Standard Result type for voxmesh
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// The first four variants are the streaming failure taxonomy. Any of them
/// leaves region state indeterminate and is treated as fatal by callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("synchronization failed: {0}")]
    Synchronization(String),

    #[error("readback failed: {0}")]
    Readback(String),

    #[error("timed out after {0:?} waiting for GPU work")]
    Timeout(std::time::Duration),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("region {region} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        region: u32,
        from: crate::streaming::MeshState,
        to: crate::streaming::MeshState,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Window error: {0}")]
    Window(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error belongs to the streaming failure taxonomy
    pub fn is_streaming_failure(&self) -> bool {
        matches!(
            self,
            Error::ResourceCreation(_)
                | Error::Submission(_)
                | Error::Synchronization(_)
                | Error::Readback(_)
                | Error::Timeout(_)
        )
    }
}
