//! FleetOps Controller
//!
//! Periodically reconciles every stored config:
//! - expires worker leases that ran out
//! - asks the engine for the next task of each cluster
//! - writes the result back, re-reading on concurrent writes
//!
//! Serves `/healthz` and `/metrics` alongside the loop.

use anyhow::Context;
use fleet_controller::server;
use fleet_controller::{ClusterProbe, ConfigReconciler, Controller, ControllerConfig, PrometheusMetrics};
use fleet_store::{ConfigStoreTrait, MemoryStore};
use reconcile_engine::{DefaultIdentity, Reconciler};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting FleetOps Controller");

    // Live node listings dial cluster API servers over rustls
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Tick: {:?}", config.tick);
    info!("  Concurrency: {}", config.concurrency);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Probe: tcp/{} ({:?} timeout)", config.probe_port, config.probe_timeout);
    info!("  Seed file: {}", config.seed_file.as_ref().map_or("none".to_string(), |p| p.display().to_string()));

    let store: Arc<dyn ConfigStoreTrait> = match &config.seed_file {
        Some(path) => Arc::new(
            MemoryStore::from_yaml_file(path)
                .await
                .with_context(|| format!("failed to seed store from {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let engine = Reconciler::new(
        Arc::new(ClusterProbe::new(config.probe_port, config.probe_timeout)),
        Arc::new(DefaultIdentity),
        metrics.clone(),
    );
    let reconciler = ConfigReconciler::new(store, engine, metrics.clone(), config.lease, config.max_dirty_retries);

    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = server::run_server(metrics, metrics_addr).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    Controller::new(reconciler, config.tick, config.concurrency)
        .run()
        .await
        .context("controller loop failed")?;

    Ok(())
}
