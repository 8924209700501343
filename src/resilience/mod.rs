//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Fetch/Pass needs an origin:
//!     → director selects a backend (excluding ones that already failed)
//!     → origin fetch (connect / first-byte / between-bytes timeouts)
//!     → On failure: retries.rs (retryable? attempts left?)
//!     → backoff.rs pause, then next attempt on another backend
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every origin call has a deadline
//! - Retries only for idempotent requests
//! - Jittered backoff prevents thundering herd against a recovering origin

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::RetryPolicy;
