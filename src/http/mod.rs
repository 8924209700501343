//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, body limit, timeout)
//!     → RequestContext (method, url, headers, client address, body)
//!     → pipeline (Receive … Log)
//!     → Delivery converted back into an HTTP response
//! ```

pub mod server;

pub use server::{AppState, HttpServer, X_REQUEST_ID};
