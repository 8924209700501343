//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the edge node.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Origin server definitions.
    pub backends: Vec<BackendConfig>,

    /// Default probe settings applied to backends without their own.
    pub probe: ProbeConfig,

    /// Director definitions grouping backends.
    pub directors: Vec<DirectorConfig>,

    /// Director used when a request does not pick one.
    pub default_director: Option<String>,

    /// Cache lifecycle defaults.
    pub cache: CacheConfig,

    /// State machine limits.
    pub pipeline: PipelineConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Client access lists.
    pub acl: AclConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum request body buffered for forwarding.
    pub max_body_bytes: usize,

    /// Total time allowed for one client request.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1024 * 1024,
            request_timeout_secs: 120,
        }
    }
}

/// Origin server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Hostname or IP address.
    pub host: String,

    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Weight for weighted directors (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,

    #[serde(default = "default_between_bytes_timeout_ms")]
    pub between_bytes_timeout_ms: u64,

    /// Backend specific probe, overriding the global one.
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

fn default_port() -> u16 {
    80
}

fn default_weight() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    3_500
}

fn default_first_byte_timeout_ms() -> u64 {
    60_000
}

fn default_between_bytes_timeout_ms() -> u64 {
    60_000
}

/// Health probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Enable active probing.
    pub enabled: bool,

    /// Path requested by the probe.
    pub path: String,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Number of recent probes considered (max 64).
    pub window: u32,

    /// Good probes within the window required to be healthy.
    pub threshold: u32,

    /// Probes assumed good when the backend is first loaded.
    pub initial: u32,

    /// Status code counted as a good probe.
    pub expected_status: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/".to_string(),
            interval_secs: 5,
            timeout_ms: 2_000,
            window: 8,
            threshold: 3,
            initial: 3,
            expected_status: 200,
        }
    }
}

/// Backend selection algorithm.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirectorPolicy {
    Random,
    Hash,
    Client,
    Fallback,
    ConsistentHash,
}

/// One backend reference inside a director.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectorMember {
    /// Name of a configured backend.
    pub backend: String,

    /// Overrides the backend's own weight.
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Director configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectorConfig {
    /// Unique director name.
    pub name: String,

    pub policy: DirectorPolicy,

    /// Ordered member list; order matters for `fallback`.
    pub members: Vec<DirectorMember>,

    /// Fraction of healthy members required (0.0 - 1.0).
    #[serde(default)]
    pub quorum: f64,

    /// Extra attempts on other members after a failed fetch.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Below quorum, select from any member instead of failing.
    #[serde(default)]
    pub fail_open: bool,

    #[serde(default = "default_vnodes")]
    pub vnodes_per_backend: u32,

    #[serde(default)]
    pub seed: u64,
}

fn default_retries() -> u32 {
    1
}

fn default_vnodes() -> u32 {
    256
}

/// Cache lifecycle defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when the origin gives no freshness information.
    pub default_ttl_secs: u64,

    /// Grace applied to every stored object.
    pub default_grace_secs: u64,

    /// Lifetime of hit-for-pass markers.
    pub hit_for_pass_secs: u64,

    /// How long a collapsed waiter waits for the shared fetch.
    pub collapse_wait_ms: u64,

    /// Hard deadline for one shared fetch, retries included.
    pub fetch_deadline_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 120,
            default_grace_secs: 10,
            hit_for_pass_secs: 120,
            collapse_wait_ms: 10_000,
            fetch_deadline_ms: 60_000,
        }
    }
}

/// Request state machine limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Restarts allowed before a request is failed.
    pub max_restarts: u32,

    /// Base delay between director retries in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Cap on the delay between director retries in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 1_000,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Bucket capacity (burst size).
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Header used as the bucket key instead of the client address.
    pub key_header: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 50,
            refill_per_sec: 100.0,
            key_header: None,
        }
    }
}

/// Client access lists.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Addresses or CIDR blocks refused with 403.
    pub deny: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
