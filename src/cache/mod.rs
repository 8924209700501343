//! Cache subsystem.
//!
//! # Data Flow
//! ```text
//! Hash stage → key.rs (ordered contributions → SHA-256 key)
//!     → lifecycle.rs lookup
//!         - Fresh/Stale object → Hit (stale starts a background refresh)
//!         - Hit-for-pass marker → Pass
//!         - Nothing usable → Miss → shared fetch (one per key)
//!     → policy.rs decides admission of the fetched object
//!     → store.rs keeps it until every window has closed
//! ```
//!
//! # Design Decisions
//! - Freshness is derived from age at lookup time, never stored
//! - Concurrent misses on one key share a single origin fetch
//! - A failed or uncacheable fetch leaves the previous object in place
//! - Server errors are only stored when stale-if-error was set

pub mod entry;
pub mod key;
pub mod lifecycle;
pub mod policy;
pub mod store;

pub use entry::{CacheEntry, CachedResponse, Freshness};
pub use key::{CacheKey, KeyBuilder};
pub use lifecycle::{CacheEngine, Diversion, FetchedObject, FlightResult, Lookup};
pub use policy::{Admission, StoragePolicy};
