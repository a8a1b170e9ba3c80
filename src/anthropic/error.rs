use thiserror::Error;

use crate::resilience::Retryable;

/// Failures talking to the Anthropic API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-2xx status, with the response body as message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The call succeeded but produced no text.
    #[error("model returned an empty response")]
    EmptyResponse,
}

impl Retryable for AnthropicError {
    fn is_retryable(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } => true,
            // 529 (overloaded) is covered by the 5xx range.
            AnthropicError::ApiError { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            AnthropicError::NetworkError(e) => e.is_timeout() || e.is_connect(),
            AnthropicError::EmptyResponse => false,
        }
    }
}
