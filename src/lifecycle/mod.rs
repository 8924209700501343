//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build directors, engine, pipeline
//!     → Spawn probe loops and sweeper → Start listener
//!
//! Shutdown (shutdown.rs):
//!     SIGTERM/SIGINT → stop accepting → drain requests
//!     → broadcast to background tasks → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Background tasks never outlive the server

pub mod shutdown;

pub use shutdown::{wait_for_signal, Shutdown};
