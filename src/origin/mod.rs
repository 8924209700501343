//! Origin fetch subsystem.
//!
//! # Data Flow
//! ```text
//! Fetch/Pass stage
//!     → director picks a Backend
//!     → OriginFetch::fetch(backend, BackendRequest)
//!         - connect timeout
//!         - first-byte timeout (response head)
//!         - between-bytes timeout (every body chunk)
//!     → CachedResponse or BackendError
//! ```
//!
//! # Design Decisions
//! - The pipeline only depends on the trait; tests plug in scripted origins
//! - Bodies are buffered: a cached object is always complete
//! - Every timeout maps to its own `BackendError` variant

pub mod http;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method};
use futures_util::future::BoxFuture;

use crate::cache::CachedResponse;
use crate::director::Backend;
use crate::error::BackendError;

pub use self::http::HttpOrigin;

/// Request sent to an origin.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    /// Path and query, e.g. `/img/logo.png?v=2`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Performs one request against one backend.
pub trait OriginFetch: Send + Sync {
    fn fetch<'a>(
        &'a self,
        backend: &'a Backend,
        request: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<CachedResponse, BackendError>>;
}
