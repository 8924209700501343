//! Storage policy derived from origin responses.
//!
//! Freshness comes from `Cache-Control` (`s-maxage` over `max-age`), stale
//! windows from `stale-while-revalidate` / `stale-if-error`. Statuses outside
//! the default-cacheable set get no TTL unless the origin gives one.

use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};

use crate::config::CacheConfig;

/// How long an object is served and how long it may be served stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePolicy {
    pub ttl: Duration,
    pub grace: Duration,
    pub swr: Duration,
    /// `None` when the origin did not ask for stale-if-error.
    pub sie: Option<Duration>,
}

impl StoragePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            grace: Duration::ZERO,
            swr: Duration::ZERO,
            sie: None,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_swr(mut self, swr: Duration) -> Self {
        self.swr = swr;
        self
    }

    pub fn with_sie(mut self, sie: Duration) -> Self {
        self.sie = Some(sie);
        self
    }

    /// TTL actually applied on store: server errors are not kept unless
    /// stale-if-error was set explicitly.
    pub fn effective_ttl(&self, status: StatusCode) -> Duration {
        if status.is_server_error() && self.sie.is_none() {
            Duration::ZERO
        } else {
            self.ttl
        }
    }
}

/// What to do with a fetched object once the Fetch stage is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Insert it, replacing the previous entry.
    Cache(StoragePolicy),
    /// Remember the key as uncacheable for the given duration.
    HitForPass(Duration),
    /// Deliver it once, keep nothing.
    Uncacheable,
}

/// Parsed `Cache-Control` directives relevant to a shared cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
    pub stale_if_error: Option<u64>,
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
}

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = CacheControl::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, arg) = match directive.split_once('=') {
                    Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                let seconds = arg.and_then(|a| a.parse::<u64>().ok());
                match name.to_ascii_lowercase().as_str() {
                    "max-age" => cc.max_age = seconds,
                    "s-maxage" => cc.s_maxage = seconds,
                    "stale-while-revalidate" => cc.stale_while_revalidate = seconds,
                    "stale-if-error" => cc.stale_if_error = seconds,
                    "no-store" => cc.no_store = true,
                    "no-cache" => cc.no_cache = true,
                    "private" => cc.private = true,
                    _ => {}
                }
            }
        }
        cc
    }

    /// Shared caches must not store these.
    pub fn forbids_storage(&self) -> bool {
        self.no_store || self.no_cache || self.private
    }
}

/// Statuses that receive the default TTL without explicit freshness.
pub fn is_default_cacheable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 204 | 300 | 301 | 302 | 304 | 307 | 404 | 410)
}

/// Default admission for a response before any Fetch handler runs.
///
/// Returns the policy and whether the response may be stored at all.
pub fn from_response(status: StatusCode, headers: &HeaderMap, defaults: &CacheConfig) -> (StoragePolicy, bool) {
    let cc = CacheControl::parse(headers);

    let ttl = match cc.s_maxage.or(cc.max_age) {
        Some(secs) => Duration::from_secs(secs),
        None if is_default_cacheable(status) => Duration::from_secs(defaults.default_ttl_secs),
        None => Duration::ZERO,
    };

    let policy = StoragePolicy {
        ttl,
        grace: Duration::from_secs(defaults.default_grace_secs),
        swr: Duration::from_secs(cc.stale_while_revalidate.unwrap_or(0)),
        sie: cc.stale_if_error.map(Duration::from_secs),
    };

    let cacheable = !cc.forbids_storage() && !headers.contains_key(header::SET_COOKIE);
    (policy, cacheable)
}
