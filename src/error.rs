//! Error taxonomy shared by every stage of the request pipeline.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::config::loader::ConfigError;

/// Failures talking to an origin or choosing one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// TCP connect failed or timed out.
    #[error("connect to {0} failed")]
    Connect(String),

    /// No response headers within the first-byte timeout.
    #[error("first byte timeout from {0}")]
    FirstByteTimeout(String),

    /// Body stalled longer than the between-bytes timeout.
    #[error("between bytes timeout from {0}")]
    BetweenBytesTimeout(String),

    /// Origin answered with a status treated as a failure.
    #[error("origin returned status {0}")]
    Status(u16),

    /// Any other transport level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Every candidate was unhealthy or excluded.
    #[error("no healthy backend in director {0}")]
    NoHealthyBackend(String),

    /// Director is below quorum and configured to fail closed.
    #[error("director {0} is below quorum")]
    DirectorUnhealthy(String),

    /// The shared fetch or the waiter's own deadline expired.
    #[error("fetch deadline exceeded")]
    Deadline,
}

impl BackendError {
    /// Status synthesized when this error reaches the client.
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::FirstByteTimeout(_)
            | BackendError::BetweenBytesTimeout(_)
            | BackendError::Deadline => StatusCode::GATEWAY_TIMEOUT,
            BackendError::NoHealthyBackend(_) | BackendError::DirectorUnhealthy(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors surfaced by the request pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or forbidden request.
    #[error("client error {status}: {reason}")]
    Client { status: StatusCode, reason: String },

    /// Origin connect/timeout/5xx.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Unexpected cache entry state.
    #[error("cache error: {0}")]
    Cache(String),

    /// Client exhausted its token bucket.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Fatal configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The restart budget was exhausted.
    #[error("too many restarts ({0})")]
    TooManyRestarts(u32),

    /// A stage handler returned an action outside its allowed set.
    #[error("action {action} is not allowed in {stage}")]
    InvalidAction { stage: &'static str, action: String },

    /// A stage handler failed.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl PipelineError {
    /// Build a client error with the given status.
    pub fn client(status: StatusCode, reason: impl Into<String>) -> Self {
        PipelineError::Client {
            status,
            reason: reason.into(),
        }
    }

    /// Status code synthesized for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Client { status, .. } => *status,
            PipelineError::Backend(e) => e.status(),
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::TooManyRestarts(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Cache(_)
            | PipelineError::Config(_)
            | PipelineError::InvalidAction { .. }
            | PipelineError::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            PipelineError::from(BackendError::FirstByteTimeout("a".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            PipelineError::from(BackendError::DirectorUnhealthy("d".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PipelineError::from(BackendError::Connect("a".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            PipelineError::RateLimited { retry_after: Duration::from_secs(1) }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(PipelineError::TooManyRestarts(4).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            PipelineError::client(StatusCode::FORBIDDEN, "denied").status(),
            StatusCode::FORBIDDEN
        );
    }
}
