//! Task events
//!
//! A `TaskEvent` is one unit of remediation work handed to the external
//! workers. It is immutable once built: it owns a deep copy of the state
//! fragment it was computed from, so later changes to the snapshots never
//! leak into an already scheduled task.

use crate::cluster::Clusters;
use crate::node::Taint;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// Transition of the egress proxy between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProxyTransition {
    #[default]
    NoChange,
    Off,
    On,
    /// Proxy stays on but the no-proxy list changed
    Refresh,
}

/// Where the API endpoint moves when load balancers are involved.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ApiEndpointChange {
    #[default]
    NoChange,
    /// Endpoint moves from a control node onto a load balancer
    AttachingLoadBalancer { desired: String },
    /// Endpoint moves from a load balancer back onto a control node
    DetachingLoadBalancer { current: String },
    /// ApiServer role moves between two existing load balancers
    MoveEndpoint { current: String, desired: String },
    /// Same load balancer, its DNS hostname changes
    EndpointRenamed { id: String },
}

/// Label, annotation and taint changes for one node pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetadataPatch {
    #[serde(default)]
    pub labels_added: BTreeMap<String, String>,
    #[serde(default)]
    pub labels_deleted: Vec<String>,
    #[serde(default)]
    pub annotations_added: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations_deleted: Vec<String>,
    #[serde(default)]
    pub taints_added: Vec<Taint>,
    #[serde(default)]
    pub taints_deleted: Vec<Taint>,
}

impl PoolMetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.labels_added.is_empty()
            && self.labels_deleted.is_empty()
            && self.annotations_added.is_empty()
            && self.annotations_deleted.is_empty()
            && self.taints_added.is_empty()
            && self.taints_deleted.is_empty()
    }
}

/// What a task changes, relative to the state it embeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Delta {
    Create,
    Destroy,
    AddPool { pool: String, nodes: Vec<String> },
    AddNodes { pool: String, nodes: Vec<String> },
    DeletePool { pool: String, nodes: Vec<String>, skip_drain: bool },
    DeleteNodes { pool: String, nodes: Vec<String>, skip_drain: bool },
    ApiEndpointMove { from_pool: String, from_node: String, to_pool: String, to_node: String },
    LbApiEndpoint { change: ApiEndpointChange },
    ReplaceDns { lb: String, api_endpoint: bool },
    PatchNodes { pools: BTreeMap<String, PoolMetadataPatch> },
    UpgradeVersion { from: String, to: String },
    Proxy { transition: ProxyTransition },
    Autoscaler { gained: Vec<String>, lost: Vec<String> },
    AddRoles { lb: String, roles: Vec<String> },
    DeleteRoles { lb: String, roles: Vec<String> },
    ReconcileRoles { lb: String, internal: Vec<String>, external: Vec<String> },
    ReconcileTargetPools {
        lb: String,
        added: BTreeMap<String, Vec<String>>,
        deleted: BTreeMap<String, Vec<String>>,
    },
    JoinLoadBalancer { lb: String },
    LeaveLoadBalancer { lb: String },
    AddLbNodes { lb: String, pool: String, nodes: Vec<String>, whole_pool: bool },
    DeleteLbNodes { lb: String, pool: String, nodes: Vec<String>, whole_pool: bool },
    VpnRefresh { expected_peers: usize, observed_peers: usize },
}

impl Delta {
    /// Deltas whose partial application cannot be undone safely. These are
    /// retried until they succeed, never rolled back.
    pub fn is_non_reversible(&self) -> bool {
        matches!(
            self,
            Delta::Destroy
                | Delta::DeletePool { .. }
                | Delta::DeleteNodes { .. }
                | Delta::DeleteLbNodes { .. }
                | Delta::DeleteRoles { .. }
                | Delta::LeaveLoadBalancer { .. }
                | Delta::ApiEndpointMove { .. }
                | Delta::LbApiEndpoint { .. }
                | Delta::ReplaceDns { .. }
                | Delta::UpgradeVersion { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// State the workers converge the infrastructure to
    pub state: Clusters,
    pub delta: Delta,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RepeatKind {
    Endless,
    Bounded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepeatPolicy {
    pub kind: RepeatKind,
    /// Attempts made so far, including the first run
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Ticks left to wait before the next attempt
    #[serde(default)]
    pub wait_ticks: u64,
}

impl RepeatPolicy {
    pub fn endless() -> Self {
        Self { kind: RepeatKind::Endless, attempts: 1, max_attempts: None, wait_ticks: 0 }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self { kind: RepeatKind::Bounded, attempts: 1, max_attempts: Some(max_attempts), wait_ticks: 0 }
    }

    pub fn exhausted(&self) -> bool {
        match (self.kind, self.max_attempts) {
            (RepeatKind::Bounded, Some(max)) => self.attempts >= max,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum OnError {
    #[default]
    None,
    Repeat(RepeatPolicy),
    Rollback { tasks: Vec<TaskEvent> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub description: String,
    pub task: Task,
    pub pipeline: Vec<Stage>,
    #[serde(default)]
    pub on_error: OnError,
    /// Task that was displaced by this one and runs after it succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_priority: Option<Box<TaskEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl TaskEvent {
    pub fn new(
        kind: EventKind,
        description: impl Into<String>,
        task: Task,
        pipeline: Vec<Stage>,
        on_error: OnError,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            description: description.into(),
            task,
            pipeline,
            on_error,
            lower_priority: None,
            lease: None,
        }
    }

    /// Same logical task under a fresh id, without a lease. Used whenever a
    /// task is delivered again so downstream never sees a duplicate id.
    pub fn reissue(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            lease: None,
            ..self.clone()
        }
    }

    pub fn with_lower_priority(mut self, task: TaskEvent) -> Self {
        self.lower_priority = Some(Box::new(task));
        self
    }

    pub fn is_non_reversible(&self) -> bool {
        self.task.delta.is_non_reversible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(delta: Delta) -> TaskEvent {
        TaskEvent::new(
            EventKind::Update,
            "test",
            Task { state: Clusters::default(), delta },
            Vec::new(),
            OnError::None,
        )
    }

    #[test]
    fn test_reissue_gets_fresh_id_and_drops_lease() {
        let mut original = event(Delta::Create);
        original.lease = Some(Lease { expires_at: Utc::now() });
        let again = original.reissue();
        assert_ne!(original.id, again.id);
        assert!(again.lease.is_none());
        assert_eq!(original.task, again.task);
    }

    #[test]
    fn test_non_reversible_classes() {
        assert!(event(Delta::Destroy).is_non_reversible());
        assert!(event(Delta::UpgradeVersion { from: "1.30".into(), to: "1.31".into() }).is_non_reversible());
        assert!(event(Delta::ReplaceDns { lb: "lb".into(), api_endpoint: true }).is_non_reversible());
        assert!(!event(Delta::AddPool { pool: "p".into(), nodes: vec![] }).is_non_reversible());
        assert!(!event(Delta::Proxy { transition: ProxyTransition::On }).is_non_reversible());
    }

    #[test]
    fn test_bounded_repeat_exhaustion() {
        let mut policy = RepeatPolicy::bounded(3);
        assert!(!policy.exhausted());
        policy.attempts = 3;
        assert!(policy.exhausted());
        let mut endless = RepeatPolicy::endless();
        endless.attempts = 1000;
        assert!(!endless.exhausted());
    }
}
