//! FleetOps controller library
//!
//! Everything the `fleet-controller` binary wires together: environment
//! configuration, the tick loop, per-config reconciliation with task
//! dispatch, the TCP/kube health probe and the Prometheus sink.

pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod metrics;
pub mod reconciler;
pub mod server;

pub use config::ControllerConfig;
pub use controller::{Controller, TickSummary};
pub use error::ControllerError;
pub use health::ClusterProbe;
pub use metrics::PrometheusMetrics;
pub use reconciler::{ConfigOutcome, ConfigReconciler};
