//! Caching edge HTTP request pipeline.

// Core request path
pub mod cache;
pub mod http;
pub mod origin;
pub mod pipeline;

// Traffic management
pub mod director;
pub mod health;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use cache::CacheEngine;
pub use config::EdgeConfig;
pub use error::{BackendError, PipelineError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::{Pipeline, RequestContext};
