//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Per-backend timer
//!     → Probe collaborator issues a synthetic request
//!     → state.rs sliding window records the result
//!     → Backend health bit updated (read by directors)
//! ```
//!
//! # Design Decisions
//! - Every backend has its own timer; a slow probe never delays another backend
//! - Window/threshold/initial policy prevents flapping
//! - Health state is per-backend, shared by every director that lists it

pub mod active;
pub mod state;

pub use active::{HealthMonitor, HttpProbe, Probe};
pub use state::ProbeWindow;
