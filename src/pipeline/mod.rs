//! Request pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! Receive ──hash──► Hash ──► Lookup ──► Hit ──deliver──────────────► Deliver ──► Log
//!    │                          │  └──► Miss ──fetch──► Fetch ─────────▲
//!    └──pass──────────────────► Pass ◄──(hit-for-pass)    │            │
//!                                 └──────────────────────► Fetch ──────┘
//!
//! Any stage ──error──► Error ──► Deliver
//! Receive / Hit / Fetch / Error / Deliver ──restart──► Receive (bounded)
//! ```
//!
//! # Design Decisions
//! - Handlers return an `Action`; the machine owns every transition
//! - Each stage has an allowed action set; anything else is a 500
//! - Restarts are counted in the request context, never recursive
//! - Header contents belong to handlers (headers.rs), not to the machine

pub mod context;
pub mod headers;
pub mod hooks;
pub mod machine;
pub mod state;
pub mod synthetic;

pub use context::{BackendResponse, CacheStatus, Delivery, RequestContext};
pub use hooks::{BuiltinHandlers, StageHandlers};
pub use machine::{Pipeline, PipelineBuilder};
pub use state::{Action, Stage};
pub use synthetic::{JsonSynthesizer, Synthesizer};
