//! Edge request pipeline server.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌───────────────────────────────────────────────────────┐
//!                         │                     EDGE PIPELINE                     │
//!                         │                                                       │
//!   Client Request        │  ┌────────┐    ┌──────────────────────────────────┐   │
//!   ──────────────────────┼─▶│  http  │───▶│ pipeline (Receive … Deliver/Log) │   │
//!                         │  │ server │    └───────┬──────────────┬───────────┘   │
//!                         │  └────────┘            │              │               │
//!                         │                        ▼              ▼               │
//!                         │                 ┌────────────┐  ┌────────────┐        │
//!                         │                 │   cache    │  │  director  │        │
//!                         │                 │  engine    │  │  + backend │        │
//!                         │                 └─────┬──────┘  └─────┬──────┘        │
//!                         │                       │ shared fetch  │               │
//!   Client Response       │                       ▼               ▼               │
//!   ◀─────────────────────┼──────────────────  origin (timeouts, retries) ◀───────┼──── Origin
//!                         │                                                       │
//!                         │  Cross-cutting: config · health probes · security     │
//!                         │                 observability · lifecycle             │
//!                         └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use edge_pipeline::config::{loader::load_config, EdgeConfig};
use edge_pipeline::director::DirectorSet;
use edge_pipeline::health::{HealthMonitor, HttpProbe};
use edge_pipeline::http::HttpServer;
use edge_pipeline::lifecycle::{wait_for_signal, Shutdown};
use edge_pipeline::observability::{logging, metrics};
use edge_pipeline::origin::HttpOrigin;
use edge_pipeline::pipeline::Pipeline;

/// Dead cache slots are removed this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "edge-pipeline", version, about = "Caching edge HTTP pipeline")]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => load_config(path),
        None => Ok(EdgeConfig::default()),
    };
    let level = loaded
        .as_ref()
        .map(|c| c.observability.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    logging::init(&level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration rejected");
            return Err(e.into());
        }
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        directors = config.directors.len(),
        "Configuration loaded"
    );
    if args.check {
        return Ok(());
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let directors = Arc::new(DirectorSet::from_config(&config));
    if directors.all_backends().is_empty() {
        tracing::warn!("No backends configured; every fetch will fail");
    }

    let shutdown = Shutdown::new();
    let probes = HealthMonitor::new(&directors, &config, Arc::new(HttpProbe::new())).spawn(&shutdown);

    let pipeline = Pipeline::from_config(&config, directors, Arc::new(HttpOrigin::new()))?.build();
    let sweeper = pipeline.engine().spawn_sweeper(SWEEP_INTERVAL, shutdown.subscribe());

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    HttpServer::new(&config.listener, pipeline)
        .run(listener, wait_for_signal())
        .await?;

    shutdown.trigger();
    for probe in probes {
        let _ = probe.await;
    }
    let _ = sweeper.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
