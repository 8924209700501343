//! Cached objects and their age-based state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use tokio::time::Instant;

use crate::cache::key::CacheKey;
use crate::cache::policy::StoragePolicy;

/// Derived state of an entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve without revalidation.
    Fresh,
    /// Serve immediately, refresh in the background.
    Stale,
    /// A blocking fetch is required.
    Expired,
}

/// Pure classification of an entry's age.
///
/// The stale window is `max(grace, swr)`.
pub fn classify(age: Duration, ttl: Duration, grace: Duration, swr: Duration) -> Freshness {
    if age < ttl {
        Freshness::Fresh
    } else if age < ttl.saturating_add(grace.max(swr)) {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// Status, headers and body of a response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

/// One stored object.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: CachedResponse,
    pub ttl: Duration,
    pub grace: Duration,
    pub swr: Duration,
    pub sie: Duration,
    pub created_at: Instant,
    hits: AtomicU64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, response: CachedResponse, policy: &StoragePolicy, created_at: Instant) -> Self {
        Self {
            key,
            response,
            ttl: policy.ttl,
            grace: policy.grace,
            swr: policy.swr,
            sie: policy.sie.unwrap_or_default(),
            created_at,
            hits: AtomicU64::new(0),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn freshness(&self, now: Instant) -> Freshness {
        classify(self.age(now), self.ttl, self.grace, self.swr)
    }

    /// True while a failed refresh may still fall back to this body.
    pub fn within_stale_if_error(&self, now: Instant) -> bool {
        self.age(now) < self.ttl.saturating_add(self.sie)
    }

    /// Age after which the entry is useless for every purpose.
    pub fn retention(&self) -> Duration {
        self.ttl.saturating_add(self.grace.max(self.swr).max(self.sie))
    }

    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}
