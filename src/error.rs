use std::time::Duration;

use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::resilience::Retryable;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No rate limit registered for collaborator '{0}'")]
    UnknownRateLimit(String),

    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error("Work item already queued: {0}")]
    DuplicateItem(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Stage '{stage}' timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Configuration(message.into())
    }
}

impl Retryable for RelayError {
    /// Collaborator and I/O failures are transient; anything describing a
    /// bad configuration or a missing record will fail the same way again.
    fn is_retryable(&self) -> bool {
        match self {
            RelayError::Anthropic(e) => e.is_retryable(),
            RelayError::Source(_) | RelayError::Io(_) | RelayError::StageTimeout { .. } => true,
            RelayError::Configuration(_)
            | RelayError::UnknownRateLimit(_)
            | RelayError::ItemNotFound(_)
            | RelayError::DuplicateItem(_)
            | RelayError::Stage { .. }
            | RelayError::Synthesis(_)
            | RelayError::Json(_)
            | RelayError::Toml(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display() {
        let err = RelayError::config("max_requests must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_requests must be at least 1"
        );
    }

    #[test]
    fn stage_timeout_display() {
        let err = RelayError::StageTimeout {
            stage: "research".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "Stage 'research' timed out after 2s");
    }

    #[test]
    fn retryable_classification() {
        assert!(RelayError::Source("connection reset".into()).is_retryable());
        assert!(
            RelayError::Anthropic(AnthropicError::RateLimited {
                retry_after_ms: 1000
            })
            .is_retryable()
        );
        assert!(!RelayError::ItemNotFound("q-1".into()).is_retryable());
        assert!(!RelayError::config("bad").is_retryable());
        assert!(
            !RelayError::Anthropic(AnthropicError::ApiError {
                status: 401,
                message: "invalid key".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<RelayError>();
    }
}
