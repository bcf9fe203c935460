//! Per-cluster reconciliation state and the persisted config document.

use crate::cluster::Clusters;
use crate::task::TaskEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    WaitForPickup,
    InProgress,
    #[default]
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub status: WorkflowStatus,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Infrastructure as last confirmed by a worker report
    #[serde(default)]
    pub current: Clusters,
    /// Target declared by the operator
    #[serde(default)]
    pub desired: Clusters,
    /// Task executing right now, or the last one that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<TaskEvent>,
    /// Pending tasks, executed head first
    #[serde(default)]
    pub events: VecDeque<TaskEvent>,
    #[serde(default)]
    pub state: Workflow,
}

impl ClusterState {
    pub fn new(desired: Clusters) -> Self {
        Self { desired, ..Default::default() }
    }

    /// Nothing exists, nothing is wanted and nothing is running.
    pub fn is_removable(&self) -> bool {
        self.current.is_empty() && self.desired.is_empty() && self.in_flight.is_none()
    }

    /// A worker holds (or is about to pick up) the in-flight task.
    pub fn is_in_flight_executing(&self) -> bool {
        self.in_flight.is_some()
            && matches!(self.state.status, WorkflowStatus::WaitForPickup | WorkflowStatus::InProgress)
    }
}

/// Versioned document persisted in the configuration store. The version is
/// bumped on every successful write; writes against a stale version are
/// rejected by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterState>,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}
