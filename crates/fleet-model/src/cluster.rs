//! Cluster snapshots
//!
//! `Clusters` is one snapshot of a managed cluster: the Kubernetes cluster
//! plus the load-balancer clusters attached to it. Two snapshots (current
//! and desired) are what the reconciliation engine diffs.

use crate::node::{Node, NodePool, Provider};
use serde::{Deserialize, Serialize};

/// Name and node pools shared by Kubernetes and load-balancer clusters.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// Cluster name from the manifest
    pub name: String,
    /// Random suffix generated once per cluster, part of the cluster id
    #[serde(default)]
    pub hash: String,
    /// Node pools, in manifest order
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

impl ClusterInfo {
    /// Identity of the cluster. Uniqueness of names is enforced upstream.
    pub fn id(&self) -> String {
        if self.hash.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, self.hash)
        }
    }

    pub fn pool(&self, name: &str) -> Option<&NodePool> {
        self.node_pools.iter().find(|p| p.name == name)
    }

    pub fn pool_mut(&mut self, name: &str) -> Option<&mut NodePool> {
        self.node_pools.iter_mut().find(|p| p.name == name)
    }

    pub fn control_pools(&self) -> impl Iterator<Item = &NodePool> {
        self.node_pools.iter().filter(|p| p.control)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_pools.iter().flat_map(|p| p.nodes.iter())
    }

    /// Pool and node currently serving the API endpoint, if it sits on a node.
    pub fn api_endpoint(&self) -> Option<(&NodePool, &Node)> {
        self.control_pools()
            .find_map(|p| p.nodes.iter().find(|n| n.is_api_endpoint()).map(|n| (p, n)))
    }

    pub fn has_static_pools(&self) -> bool {
        self.node_pools.iter().any(NodePool::is_static)
    }

    pub fn has_dynamic_pools(&self) -> bool {
        self.node_pools.iter().any(NodePool::is_dynamic)
    }
}

/// Forward proxy the cluster nodes use for egress.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    /// Proxy URL (e.g., "http://proxy.internal:3128")
    pub http_proxy_url: String,
    /// Hosts and CIDRs reached directly
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

/// The Kubernetes cluster of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct K8sCluster {
    /// Name, hash and node pools
    pub info: ClusterInfo,

    /// Kubernetes version (e.g., "1.31.0")
    pub kubernetes_version: String,

    /// CIDR of the VPN the nodes are meshed into
    #[serde(default)]
    pub network: String,

    /// Admin kubeconfig, filled in once the cluster is bootstrapped
    #[serde(default)]
    pub kubeconfig: String,

    /// Egress proxy; `None` when nodes reach the internet directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,
}

impl K8sCluster {
    pub fn id(&self) -> String {
        self.info.id()
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.is_some()
    }

    /// The API server is considered active once any control node exists.
    pub fn api_server_active(&self) -> bool {
        self.info.control_pools().any(|p| !p.nodes.is_empty())
    }
}

/// What a load-balancer role forwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RoleType {
    /// Kubernetes API traffic to the control plane
    ApiServer,
    /// Application traffic
    Ingress,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleSettings {
    /// Forward client addresses with the PROXY protocol
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Pin clients to one backend
    #[serde(default)]
    pub sticky_sessions: bool,
}

/// A listener on a load balancer and the pools it forwards to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Role name, unique within the load balancer
    pub name: String,

    /// Transport protocol (e.g., "tcp")
    pub protocol: String,

    /// Port the load balancer listens on
    pub port: u16,

    /// Port on the target nodes
    pub target_port: u16,

    /// Names of the Kubernetes node pools receiving the traffic
    #[serde(default)]
    pub target_pools: Vec<String>,

    /// API server or ingress
    pub role_type: RoleType,

    /// Forwarding options
    #[serde(default)]
    pub settings: RoleSettings,
}

impl Role {
    /// Settings applied on the load-balancer nodes only.
    pub fn internal_settings_differ(&self, other: &Role) -> bool {
        self.target_port != other.target_port || self.settings != other.settings
    }

    /// Settings visible from outside (firewalls, listeners).
    pub fn external_settings_differ(&self, other: &Role) -> bool {
        self.port != other.port || self.protocol != other.protocol
    }
}

/// DNS record pointing at a load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    /// Zone the record is created in
    pub dns_zone: String,
    /// Host part of the record
    #[serde(default)]
    pub hostname: String,
    /// Account managing the zone
    pub provider: Provider,
    /// Fully qualified endpoint, an output of provisioning
    #[serde(default)]
    pub endpoint: String,
    /// Extra hostnames resolving to the same endpoint
    #[serde(default)]
    pub alternative_names: Vec<String>,
}

impl Dns {
    /// Structural comparison of the operator-controlled fields. The endpoint
    /// is an output and is ignored.
    pub fn differs_from(&self, other: &Dns) -> bool {
        if !self.provider.same_account(&other.provider) {
            return true;
        }
        self.dns_zone != other.dns_zone
            || self.hostname != other.hostname
            || self.alternative_names != other.alternative_names
            || self.provider.template != other.provider.template
    }
}

/// A load-balancer cluster attached to the Kubernetes cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerCluster {
    /// Name, hash and the load-balancer node pools
    pub info: ClusterInfo,
    /// Listeners
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
    /// Id of the Kubernetes cluster this load balancer serves
    #[serde(default)]
    pub target_k8s: String,
}

impl LoadBalancerCluster {
    pub fn id(&self) -> String {
        self.info.id()
    }

    pub fn has_api_role(&self) -> bool {
        self.roles.iter().any(|r| r.role_type == RoleType::ApiServer)
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn targets_pool(&self, pool: &str) -> bool {
        self.roles.iter().any(|r| r.target_pools.iter().any(|p| p == pool))
    }
}

/// One snapshot of a managed cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Clusters {
    /// Absent before creation and after destruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<K8sCluster>,
    /// Load balancers attached to `k8s`
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerCluster>,
}

impl Clusters {
    pub fn is_empty(&self) -> bool {
        self.k8s.is_none() && self.load_balancers.is_empty()
    }

    pub fn load_balancer(&self, id: &str) -> Option<&LoadBalancerCluster> {
        self.load_balancers.iter().find(|lb| lb.id() == id)
    }

    pub fn load_balancer_mut(&mut self, id: &str) -> Option<&mut LoadBalancerCluster> {
        self.load_balancers.iter_mut().find(|lb| lb.id() == id)
    }

    /// First load balancer carrying the API server role, lowest id first.
    pub fn api_load_balancer(&self) -> Option<&LoadBalancerCluster> {
        self.load_balancers
            .iter()
            .filter(|lb| lb.has_api_role())
            .min_by_key(|lb| lb.id())
    }

    /// True when any load-balancer role targets the given k8s pool.
    pub fn pool_targeted_by_load_balancer(&self, pool: &str) -> bool {
        self.load_balancers.iter().any(|lb| lb.targets_pool(pool))
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.k8s
            .iter()
            .flat_map(|k| k.info.nodes())
            .chain(self.load_balancers.iter().flat_map(|lb| lb.info.nodes()))
    }

    /// Number of nodes that should be VPN peers of each other.
    pub fn mesh_size(&self) -> usize {
        self.all_nodes().count()
    }
}
