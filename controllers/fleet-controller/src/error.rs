//! Controller-specific error types.
//!
//! Wraps the errors of the store, the engine and the outer surfaces
//! (kube, metrics, sockets) the controller talks to.

use fleet_store::StoreError;
use kube::Error as KubeError;
use reconcile_engine::{DispatchError, EngineError};
use thiserror::Error;

/// Errors that can occur in the FleetOps controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Configuration store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Reconciliation engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Worker report that does not match the in-flight task
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Metric registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every write attempt lost against a concurrent writer
    #[error("Config {config} still dirty after {attempts} attempts")]
    DirtyWriteRetriesExhausted { config: String, attempts: u32 },
}
