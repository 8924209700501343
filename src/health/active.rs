//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend on its own timer
//! - Feed results into the backend's probe window
//! - Publish the resulting health bit to the backend

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use futures_util::future::BoxFuture;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{EdgeConfig, ProbeConfig};
use crate::director::{Backend, DirectorSet};
use crate::health::state::ProbeWindow;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Issues one synthetic request against a backend.
pub trait Probe: Send + Sync {
    /// Resolve to `true` when the backend answered as expected.
    fn check<'a>(&'a self, backend: &'a Backend, config: &'a ProbeConfig) -> BoxFuture<'a, bool>;
}

/// Plain HTTP GET probe.
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for HttpProbe {
    fn check<'a>(&'a self, backend: &'a Backend, config: &'a ProbeConfig) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let uri = format!("http://{}{}", backend.authority(), config.path);
            let request = match Request::builder()
                .method("GET")
                .uri(uri)
                .header("user-agent", "edge-pipeline-probe")
                .header("host", backend.host.as_str())
                .body(Body::empty())
            {
                Ok(req) => req,
                Err(e) => {
                    tracing::error!(backend = %backend.name, error = %e, "Failed to build probe request");
                    return false;
                }
            };

            let timeout = Duration::from_millis(config.timeout_ms);
            match time::timeout(timeout, self.client.request(request)).await {
                Ok(Ok(response)) => {
                    let ok = response.status().as_u16() == config.expected_status;
                    if !ok {
                        tracing::debug!(backend = %backend.name, status = %response.status(), "Probe failed: unexpected status");
                    }
                    ok
                }
                Ok(Err(e)) => {
                    tracing::debug!(backend = %backend.name, error = %e, "Probe failed: connection error");
                    false
                }
                Err(_) => {
                    tracing::debug!(backend = %backend.name, "Probe failed: timeout");
                    false
                }
            }
        })
    }
}

struct ProbeTarget {
    backend: Arc<Backend>,
    config: ProbeConfig,
}

/// Owns the probe loops for every backend.
pub struct HealthMonitor {
    targets: Vec<ProbeTarget>,
    probe: Arc<dyn Probe>,
}

impl HealthMonitor {
    pub fn new(directors: &DirectorSet, config: &EdgeConfig, probe: Arc<dyn Probe>) -> Self {
        let targets = directors
            .all_backends()
            .into_iter()
            .map(|backend| {
                let probe_config = config
                    .backends
                    .iter()
                    .find(|b| b.name == backend.name)
                    .and_then(|b| b.probe.clone())
                    .unwrap_or_else(|| config.probe.clone());
                ProbeTarget {
                    backend,
                    config: probe_config,
                }
            })
            .filter(|t| t.config.enabled)
            .collect();

        Self { targets, probe }
    }

    /// Probe an explicit list of backends with one probe config.
    pub fn for_backends(backends: Vec<Arc<Backend>>, config: ProbeConfig, probe: Arc<dyn Probe>) -> Self {
        let targets = backends
            .into_iter()
            .map(|backend| ProbeTarget {
                backend,
                config: config.clone(),
            })
            .collect();
        Self { targets, probe }
    }

    /// Start one independent probe task per backend.
    pub fn spawn(self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        tracing::info!(backends = self.targets.len(), "Health monitor starting");
        self.targets
            .into_iter()
            .map(|target| {
                let probe = self.probe.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(run_target(target, probe, shutdown))
            })
            .collect()
    }
}

async fn run_target(target: ProbeTarget, probe: Arc<dyn Probe>, mut shutdown: broadcast::Receiver<()>) {
    let ProbeTarget { backend, config } = target;
    let mut window = ProbeWindow::from_config(&config);
    backend.set_healthy(window.is_healthy());
    metrics::record_backend_health(&backend.name, backend.is_healthy());

    let mut ticker = time::interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ok = probe.check(&backend, &config).await;
                window.record(ok);
                let healthy = window.is_healthy();
                if backend.set_healthy(healthy) {
                    if healthy {
                        tracing::info!(backend = %backend.name, good = window.good(), "Backend is healthy");
                    } else {
                        tracing::warn!(backend = %backend.name, good = window.good(), "Backend went sick");
                    }
                }
                metrics::record_backend_health(&backend.name, healthy);
            }
            _ = shutdown.recv() => {
                tracing::debug!(backend = %backend.name, "Probe loop received shutdown signal, exiting");
                break;
            }
        }
    }
}
