//! Diff engine
//!
//! Structural diffs between the current and desired snapshot of a cluster.
//! Every diff is recomputed on each tick and never mutated afterwards.

mod kubernetes;
mod labels;
mod loadbalancers;
mod nodepools;

pub use kubernetes::{
    ApiEndpointTracking, KubernetesDiff, NodeRef, RollingUpdate, kubernetes_diff, proxy_transition,
};
pub use labels::{labels_taints_annotations_diff, metadata_patch};
pub use loadbalancers::{
    LbIndex, LoadBalancerModification, LoadBalancersDiff, api_endpoint_change, load_balancers_diff,
};
pub use nodepools::{NodePoolsDiff, node_pools_diff};

#[cfg(test)]
#[path = "nodepools_test.rs"]
mod nodepools_test;
