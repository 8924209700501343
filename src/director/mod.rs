//! Director subsystem: backend selection.
//!
//! # Data Flow
//! ```text
//! Fetch needs an origin → request's director identified
//!     → quorum check over member health bits
//!     → candidate set (healthy, minus backends already tried by this request)
//!     → Apply selection algorithm:
//!         - random.rs (weighted random)
//!         - hash.rs (cache key or client identity)
//!         - fallback.rs (first healthy in declared order)
//!         - consistent_hash.rs (vnode ring)
//!     → Backend or BackendError
//! ```
//!
//! # Design Decisions
//! - Directors are immutable once built; only health bits change
//! - Selection never blocks: health is read from atomics
//! - Unhealthy backends are only returned below quorum with fail-open
//! - Retry exclusions belong to a single request and are never stored here

pub mod backend;
pub mod consistent_hash;
pub mod fallback;
pub mod hash;
pub mod pool;
pub mod random;

use std::fmt;
use std::sync::Arc;

use crate::config::DirectorPolicy;
use crate::error::BackendError;

pub use backend::{Backend, Timeouts};
pub use pool::DirectorSet;

/// A backend as seen by one director.
#[derive(Debug, Clone)]
pub struct Member {
    pub backend: Arc<Backend>,
    pub weight: u32,
}

impl Member {
    pub fn new(backend: Arc<Backend>) -> Self {
        let weight = backend.weight;
        Self { backend, weight }
    }

    pub fn with_weight(backend: Arc<Backend>, weight: u32) -> Self {
        Self { backend, weight }
    }
}

/// Per-request inputs to selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectContext<'a> {
    /// Hash of the request's cache key.
    pub key_hash: u64,
    /// Hash of the client identity token.
    pub client_hash: u64,
    /// Backends that already failed for this request.
    pub exclude: &'a [String],
}

/// A selection algorithm.
///
/// `candidates` holds indexes into `members`, in declared order, already
/// filtered for health and exclusions. Implementations return one of them.
pub trait Selector: Send + Sync + fmt::Debug {
    fn select(&self, members: &[Member], candidates: &[usize], ctx: &SelectContext<'_>)
        -> Option<usize>;
}

/// A named backend group with a selection policy.
#[derive(Debug)]
pub struct Director {
    name: String,
    policy: DirectorPolicy,
    members: Vec<Member>,
    selector: Box<dyn Selector>,
    quorum: f64,
    retries: u32,
    fail_open: bool,
}

impl Director {
    /// Build a director. `vnodes_per_backend` and `seed` only matter for
    /// consistent hashing.
    pub fn new(
        name: impl Into<String>,
        policy: DirectorPolicy,
        members: Vec<Member>,
        vnodes_per_backend: u32,
        seed: u64,
    ) -> Self {
        let selector: Box<dyn Selector> = match policy {
            DirectorPolicy::Random => Box::new(random::WeightedRandom),
            DirectorPolicy::Hash => Box::new(hash::KeyHash::cache_key()),
            DirectorPolicy::Client => Box::new(hash::KeyHash::client()),
            DirectorPolicy::Fallback => Box::new(fallback::Fallback),
            DirectorPolicy::ConsistentHash => Box::new(consistent_hash::HashRing::new(
                &members,
                vnodes_per_backend,
                seed,
            )),
        };

        Self {
            name: name.into(),
            policy,
            members,
            selector,
            quorum: 0.0,
            retries: 0,
            fail_open: false,
        }
    }

    pub fn with_quorum(mut self, quorum: f64) -> Self {
        self.quorum = quorum.clamp(0.0, 1.0);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> DirectorPolicy {
        self.policy
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn healthy_count(&self) -> usize {
        self.members.iter().filter(|m| m.backend.is_healthy()).count()
    }

    /// True iff `healthy / total >= quorum`.
    pub fn is_healthy(&self) -> bool {
        let total = self.members.len();
        if total == 0 {
            return false;
        }
        self.healthy_count() as f64 / total as f64 >= self.quorum
    }

    /// Pick a backend for one attempt.
    pub fn select(&self, ctx: &SelectContext<'_>) -> Result<Arc<Backend>, BackendError> {
        let excluded = |m: &Member| ctx.exclude.iter().any(|name| *name == m.backend.name);

        let candidates: Vec<usize> = if self.is_healthy() {
            self.members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.backend.is_healthy() && !excluded(m))
                .map(|(i, _)| i)
                .collect()
        } else if self.fail_open && !self.members.is_empty() {
            tracing::warn!(
                director = %self.name,
                healthy = self.healthy_count(),
                total = self.members.len(),
                "Director below quorum, selecting from all members"
            );
            self.members
                .iter()
                .enumerate()
                .filter(|(_, m)| !excluded(m))
                .map(|(i, _)| i)
                .collect()
        } else {
            return Err(BackendError::DirectorUnhealthy(self.name.clone()));
        };

        if candidates.is_empty() {
            return Err(BackendError::NoHealthyBackend(self.name.clone()));
        }

        self.selector
            .select(&self.members, &candidates, ctx)
            .and_then(|i| self.members.get(i))
            .map(|m| m.backend.clone())
            .ok_or_else(|| BackendError::NoHealthyBackend(self.name.clone()))
    }
}
