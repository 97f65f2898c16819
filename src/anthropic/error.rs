//! Error types for the Anthropic API client.

use thiserror::Error;

/// Errors returned by a [`MessageSender`](super::MessageSender).
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status, with the response body as message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// DNS, connection or timeout failure, or an undecodable body.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Rate limits, network failures and 5xx responses may succeed later;
    /// other API errors (bad key, malformed request) will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } | AnthropicError::NetworkError(_) => true,
            AnthropicError::ApiError { status, .. } => *status >= 500,
        }
    }

    /// Server-suggested wait before the next call, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AnthropicError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
