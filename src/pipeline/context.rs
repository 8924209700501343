//! Per-request state carried through the pipeline.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};

use crate::cache::{CacheKey, CachedResponse, StoragePolicy};
use crate::origin::BackendRequest;
use crate::pipeline::headers;

/// How the delivered response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Pass,
    Stale,
    Synth,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Pass => "PASS",
            CacheStatus::Stale => "STALE",
            CacheStatus::Synth => "SYNTH",
        }
    }

    /// Lowercase label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Pass => "pass",
            CacheStatus::Stale => "stale",
            CacheStatus::Synth => "synth",
        }
    }
}

/// The client request and the control state attached to it.
///
/// Survives restarts: headers set by a handler stay set, the counter only grows.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    pub method: Method,
    /// Path and query.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    /// Director chosen by a handler; `None` means the default director.
    pub director: Option<String>,
    /// Backend that served the last origin fetch.
    pub backend: Option<String>,
    pub key: Option<CacheKey>,
    restarts: u32,
    pub(crate) started: Instant,
}

impl RequestContext {
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            url: url.into(),
            headers,
            body: Bytes::new(),
            client_ip: None,
            director: None,
            backend: None,
            key: None,
            restarts: 0,
            started: Instant::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub(crate) fn record_restart(&mut self) -> u32 {
        self.restarts = self.restarts.saturating_add(1);
        self.key = None;
        self.restarts
    }

    /// Host header without port.
    pub fn host(&self) -> Option<&str> {
        let host = headers::get(&self.headers, "host")?;
        match host.rsplit_once(':') {
            Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => Some(name),
            _ => Some(host),
        }
    }

    /// Token identifying the client: `key_header` if present, else the address.
    pub fn client_identity(&self, key_header: Option<&str>) -> String {
        if let Some(value) = key_header.and_then(|name| headers::get(&self.headers, name)) {
            return value.to_string();
        }
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Build the origin request.
    ///
    /// Cache fetches always use GET so the stored body can serve HEAD too.
    pub fn backend_request(&self, for_cache: bool) -> BackendRequest {
        let method = if for_cache && self.method == Method::HEAD {
            Method::GET
        } else {
            self.method.clone()
        };
        let mut request = BackendRequest::new(method, self.url.clone());
        request.headers = self.headers.clone();
        if let Some(ip) = self.client_ip {
            headers::append_forwarded_for(&mut request.headers, ip);
        }
        if !for_cache {
            request.body = self.body.clone();
        }
        request
    }
}

/// Response on its way to the client.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub response: CachedResponse,
    pub cache_status: CacheStatus,
    /// Age of the cached object; zero for fetched and synthetic responses.
    pub age: Duration,
}

impl Delivery {
    pub fn new(response: CachedResponse, cache_status: CacheStatus) -> Self {
        Self {
            response,
            cache_status,
            age: Duration::ZERO,
        }
    }

    pub fn with_age(mut self, age: Duration) -> Self {
        self.age = age;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }
}

/// Origin response as seen by the Fetch handler.
///
/// The handler may rewrite headers, the storage policy, or cacheability.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub response: CachedResponse,
    pub policy: StoragePolicy,
    pub cacheable: bool,
    /// Lifetime of the marker if the handler returns hit-for-pass.
    pub hit_for_pass_ttl: Duration,
    pub backend: String,
}

impl BackendResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status
    }
}
