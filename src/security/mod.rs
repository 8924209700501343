//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Receive stage:
//!     → acl.rs (refuse denied client addresses with 403)
//!     → rate_limit.rs (per-client token bucket, 429 on exhaustion)
//!     → Pass to stage handlers
//! ```
//!
//! # Design Decisions
//! - Checks run once per request, never again on restart
//! - Rate limit rejections are answered directly, never retried
//! - No trust in client input

pub mod acl;
pub mod rate_limit;

pub use acl::Acl;
pub use rate_limit::RateLimiter;
