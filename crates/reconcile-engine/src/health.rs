//! Health and reachability
//!
//! The engine never probes anything itself. It asks a [`HealthOracle`]
//! which node IPs are unreachable, which nodes the live cluster still
//! lists, and how many VPN peers a node sees. Callers bound each call with
//! their own timeout.

use crate::error::OracleError;
use fleet_model::{Clusters, K8sCluster, Node};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait HealthOracle: Send + Sync {
    /// Returns the subset of `ips` that did not answer.
    async fn ping(&self, ips: &[String]) -> Result<BTreeSet<String>, OracleError>;

    /// Node names registered in the live Kubernetes cluster.
    async fn live_cluster_node_names(&self, cluster: &K8sCluster) -> Result<BTreeSet<String>, OracleError>;

    /// Number of VPN peers `node` currently sees.
    async fn vpn_peer_count(&self, node: &Node) -> Result<usize, OracleError>;
}

/// Unreachable nodes of one snapshot, grouped by pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// k8s pool name -> unreachable nodes
    pub k8s: BTreeMap<String, Vec<Node>>,
    /// load balancer id -> pool name -> unreachable nodes
    pub load_balancers: BTreeMap<String, BTreeMap<String, Vec<Node>>>,
}

impl HealthReport {
    /// Pings every node of `current`. Ping failures propagate: reachability
    /// is never assumed.
    pub async fn collect(oracle: &dyn HealthOracle, current: &Clusters) -> Result<Self, OracleError> {
        let ips: Vec<String> = current
            .all_nodes()
            .map(|n| n.public_ip.clone())
            .filter(|ip| !ip.is_empty())
            .collect();
        if ips.is_empty() {
            return Ok(Self::default());
        }

        let unreachable = oracle.ping(&ips).await?;
        let mut report = Self::default();
        if unreachable.is_empty() {
            return Ok(report);
        }

        if let Some(k8s) = &current.k8s {
            for pool in &k8s.info.node_pools {
                let nodes: Vec<Node> = pool
                    .nodes
                    .iter()
                    .filter(|n| unreachable.contains(&n.public_ip))
                    .cloned()
                    .collect();
                if !nodes.is_empty() {
                    report.k8s.insert(pool.name.clone(), nodes);
                }
            }
        }
        for lb in &current.load_balancers {
            for pool in &lb.info.node_pools {
                let nodes: Vec<Node> = pool
                    .nodes
                    .iter()
                    .filter(|n| unreachable.contains(&n.public_ip))
                    .cloned()
                    .collect();
                if !nodes.is_empty() {
                    report.load_balancers.entry(lb.id()).or_default().insert(pool.name.clone(), nodes);
                }
            }
        }
        debug!("{} of {} nodes unreachable", report.count(), ips.len());
        Ok(report)
    }

    pub fn is_empty(&self) -> bool {
        self.k8s.is_empty() && self.load_balancers.is_empty()
    }

    pub fn count(&self) -> usize {
        self.k8s.values().map(Vec::len).sum::<usize>()
            + self
                .load_balancers
                .values()
                .flat_map(|pools| pools.values())
                .map(Vec::len)
                .sum::<usize>()
    }
}

/// Expected and observed VPN peer counts of the sample node, when they differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpnDrift {
    pub expected: usize,
    pub observed: usize,
}

/// Compares the VPN peers of one sample node with the mesh size of
/// `current`. Oracle errors count as "no drift".
pub async fn vpn_drift(oracle: &dyn HealthOracle, current: &Clusters) -> Option<VpnDrift> {
    let k8s = current.k8s.as_ref()?;
    let sample = k8s
        .info
        .node_pools
        .iter()
        .filter(|p| !p.nodes.is_empty())
        .min_by(|a, b| a.name.cmp(&b.name))
        .and_then(|p| p.nodes.iter().min_by(|a, b| a.name.cmp(&b.name)))?;

    let expected = current.mesh_size().saturating_sub(1);
    match oracle.vpn_peer_count(sample).await {
        Ok(observed) if observed != expected => Some(VpnDrift { expected, observed }),
        Ok(_) => None,
        Err(e) => {
            warn!("VPN peer count for {} unavailable, assuming no drift: {}", sample.name, e);
            None
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use fixed::StaticOracle;

#[cfg(any(test, feature = "test-util"))]
mod fixed {
    use super::*;

    /// Oracle with canned answers.
    #[derive(Debug, Clone, Default)]
    pub struct StaticOracle {
        unreachable: BTreeSet<String>,
        live_nodes: Option<BTreeSet<String>>,
        vpn_peers: Option<usize>,
        ping_fails: bool,
    }

    impl StaticOracle {
        /// Everything reachable, no live listing, VPN unsupported.
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_unreachable(mut self, ips: &[&str]) -> Self {
            self.unreachable.extend(ips.iter().map(|ip| ip.to_string()));
            self
        }

        pub fn with_live_nodes(mut self, names: &[&str]) -> Self {
            self.live_nodes = Some(names.iter().map(|n| n.to_string()).collect());
            self
        }

        pub fn with_vpn_peers(mut self, peers: usize) -> Self {
            self.vpn_peers = Some(peers);
            self
        }

        pub fn failing_ping(mut self) -> Self {
            self.ping_fails = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl HealthOracle for StaticOracle {
        async fn ping(&self, ips: &[String]) -> Result<BTreeSet<String>, OracleError> {
            if self.ping_fails {
                return Err(OracleError::Unavailable("ping disabled".to_string()));
            }
            Ok(ips.iter().filter(|ip| self.unreachable.contains(*ip)).cloned().collect())
        }

        async fn live_cluster_node_names(&self, cluster: &K8sCluster) -> Result<BTreeSet<String>, OracleError> {
            self.live_nodes
                .clone()
                .ok_or_else(|| OracleError::Unavailable(format!("no live listing for {}", cluster.id())))
        }

        async fn vpn_peer_count(&self, node: &Node) -> Result<usize, OracleError> {
            self.vpn_peers
                .ok_or_else(|| OracleError::Unsupported(format!("vpn peers of {}", node.name)))
        }
    }
}
