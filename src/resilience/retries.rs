//! Retry policy for origin fetches.
//!
//! # Responsibilities
//! - Decide whether a failed attempt may be retried on another backend
//! - Compute the pause between attempts
//!
//! # Design Decisions
//! - Never retry non-idempotent methods (POST, PATCH); the origin may have acted
//! - Connection errors and timeouts are always retryable
//! - A 5xx answer is retried while attempts remain, otherwise delivered as is
//! - The exclusion list lives in the request, never in the director

use std::time::Duration;

use axum::http::Method;

use crate::config::PipelineConfig;
use crate::resilience::backoff::calculate_backoff;

/// Retry budget for one request against one director.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            attempts: retries.saturating_add(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Budget for `method` given the director's retry count.
    pub fn for_request(method: &Method, retries: u32, config: &PipelineConfig) -> Self {
        let retries = if is_idempotent(method) { retries } else { 0 };
        Self::new(retries).with_backoff(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// True if `attempt` (0-based) is not the last one.
    pub fn has_more(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay)
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}
