use thiserror::Error;

use crate::admission::Rejection;
use crate::anthropic::AnthropicError;
use crate::language::Language;
use crate::sandbox::SandboxError;
use crate::state_machine::JobStateError;

/// Errors raised while wiring the pipeline together from configuration.
#[derive(Debug, Error)]
pub enum CodeloopError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job {job_id}: {source}")]
    InvalidUpdate {
        job_id: String,
        #[source]
        source: JobStateError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Synchronous refusal of a submission. Nothing was queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),

    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}
