//! Error types for the reconciliation engine

use thiserror::Error;

/// Failure reported by a health oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The probe did not answer in time
    #[error("Health check timed out: {0}")]
    Timeout(String),

    /// The probed system could not be reached at all (kube API, agent)
    #[error("Health oracle unavailable: {0}")]
    Unavailable(String),

    /// The oracle cannot answer this kind of question
    #[error("Health check not supported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The live API endpoint must move but no control pool can take it over
    #[error("No control pool of cluster {0} can take over the API endpoint")]
    NoControlPlaneCandidate(String),

    /// Unreachable nodes that cannot be remediated without an operator
    #[error("Unreachable nodes need operator action: {0}")]
    UnreachableNodes(String),

    #[error("Health oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("SSH key generation failed: {0}")]
    KeyGeneration(String),

    /// Snapshots that violate a model invariant (e.g. load balancers without a cluster)
    #[error("Invalid cluster state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Errors that only an operator can resolve. The decision loop reports
    /// them as a blocked cluster instead of failing the tick.
    pub fn is_blocking(&self) -> bool {
        matches!(self, EngineError::NoControlPlaneCandidate(_) | EngineError::UnreachableNodes(_))
    }
}

/// Worker report that does not match the task the cluster is waiting on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No task is in flight")]
    NothingInFlight,

    #[error("Task {got} is not the in-flight task {expected}")]
    UnknownTask { expected: String, got: String },
}
