// ABOUTME: Error types for sandbox runs
// ABOUTME: Only provisioning failures escape a run; everything later is encoded in the result

use crate::providers::ProviderError;
use thiserror::Error;

/// Errors that reach the caller of [`crate::SandboxEngine::execute`]
#[derive(Error, Debug)]
pub enum EngineError {
    /// The substrate could not create a sandbox
    #[error("Failed to provision sandbox: {0}")]
    Provisioning(#[source] ProviderError),

    /// The run worker stopped before producing a result
    #[error("Run worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
