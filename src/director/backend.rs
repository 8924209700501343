//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single origin server
//! - Carry the per-backend fetch timeouts
//! - Expose the health bit written by the probe loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use url::Url;

use crate::config::BackendConfig;

/// Fetch timeouts for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub first_byte: Duration,
    pub between_bytes: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(3_500),
            first_byte: Duration::from_secs(60),
            between_bytes: Duration::from_secs(60),
        }
    }
}

/// A single origin server.
#[derive(Debug)]
pub struct Backend {
    /// Unique backend name.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Default weight for weighted directors.
    pub weight: u32,
    pub timeouts: Timeouts,
    /// Written by the health monitor, read lock-free by directors.
    healthy: AtomicBool,
}

impl Backend {
    /// Create a new backend. Backends start healthy.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            weight: 1,
            timeouts: Timeouts::default(),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.name.clone(), config.host.clone(), config.port)
            .with_weight(config.weight)
            .with_timeouts(Timeouts {
                connect: Duration::from_millis(config.connect_timeout_ms),
                first_byte: Duration::from_millis(config.first_byte_timeout_ms),
                between_bytes: Duration::from_millis(config.between_bytes_timeout_ms),
            })
    }

    /// `host:port` as used in URLs and logs.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Absolute URL for a request path on this backend.
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
        let base = Url::parse(&format!("http://{}", self.authority()))?;
        base.join(path_and_query)
    }

    // --- Health Logic ---

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Store a new health bit. Returns true if it changed.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed) != healthy
    }
}
