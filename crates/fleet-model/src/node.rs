//! Node pools and nodes
//!
//! A node pool is either cloud-provisioned (dynamic) or supplied by the user
//! (static). The two kinds share the node list, the control flag and the
//! label/taint/annotation metadata; everything else lives on the variant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role a node plays inside its cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    #[default]
    Worker,
    Master,
    /// Control-plane node that currently serves the Kubernetes API endpoint
    ApiEndpoint,
}

/// Lifecycle status of a single node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    #[default]
    Preparing,
    Ready,
    /// Scheduled for removal; the deletion must be completed before the
    /// node may be re-added.
    MarkedForDeletion,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name, `<cluster>-<pool>-NN` for dynamic pools
    pub name: String,

    /// Public (endpoint) IP of the node
    #[serde(default)]
    pub public_ip: String,

    /// Private IP inside the VPN mesh
    #[serde(default)]
    pub private_ip: String,

    /// Role inside the cluster
    #[serde(default)]
    pub node_type: NodeType,

    /// Lifecycle status
    #[serde(default)]
    pub status: NodeStatus,

    /// Login user, only meaningful for static nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, public_ip: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            public_ip: public_ip.into(),
            node_type,
            ..Default::default()
        }
    }

    pub fn is_api_endpoint(&self) -> bool {
        self.node_type == NodeType::ApiEndpoint
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.status == NodeStatus::MarkedForDeletion
    }
}

/// Kubernetes taint. Two taints are the same taint when key, value and
/// effect all match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    /// May be empty
    #[serde(default)]
    pub value: String,
    /// Taint effect (e.g., "NoSchedule", "NoExecute")
    pub effect: String,
}

/// Git repository holding the infrastructure templates of a provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRepository {
    /// Repository URL
    pub repository: String,
    /// Tag the operator pinned, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Commit the templates were resolved to. A change triggers a rolling update.
    pub commit_hash: String,
    /// Directory of the templates inside the repository
    #[serde(default)]
    pub path: String,
}

/// Cloud account a dynamic pool is provisioned in.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Name the operator gave the provider in the manifest
    pub name: String,
    /// Cloud vendor, e.g. "hetzner", "aws", "gcp"
    pub cloud_provider: String,
    /// Templates used to provision the pool
    #[serde(default)]
    pub template: TemplateRepository,
}

impl Provider {
    /// Providers are interchangeable when they point at the same account
    /// of the same vendor; the templates may still differ.
    pub fn same_account(&self, other: &Provider) -> bool {
        self.name == other.name && self.cloud_provider == other.cloud_provider
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerConfig {
    /// Lower bound on the node count
    pub min: u32,
    /// Upper bound on the node count
    pub max: u32,
    /// Node count the autoscaler currently asks for. Replaces `count`
    /// while the autoscaler is configured.
    pub target_size: u32,
}

/// SSH keypair in OpenSSH encoding.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyPair {
    /// `authorized_keys` line
    pub public_key: String,
    /// PEM-armoured private key
    pub private_key: String,
}

impl SshKeyPair {
    pub fn is_empty(&self) -> bool {
        self.public_key.is_empty() && self.private_key.is_empty()
    }
}

/// Cloud-provisioned node pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicNodePool {
    /// Account and templates the pool is provisioned with
    pub provider: Provider,

    /// Provider region (e.g., "fsn1", "eu-central-1")
    pub region: String,

    /// Availability zone inside the region
    #[serde(default)]
    pub zone: String,

    /// Provider machine type (e.g., "cpx21")
    #[serde(default)]
    pub server_type: String,

    /// OS image the nodes boot from
    #[serde(default)]
    pub image: String,

    /// Extra storage disk per node, in GB
    #[serde(default)]
    pub storage_disk_size: u32,

    /// Desired node count (ignored while the autoscaler is configured)
    #[serde(default)]
    pub count: u32,

    /// Autoscaler bounds; absent for fixed-size pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<AutoscalerConfig>,

    /// Private subnet of the pool (observed state, assigned at build time)
    #[serde(default)]
    pub cidr: String,

    /// Keypair the nodes are provisioned with (observed state)
    #[serde(default)]
    pub ssh_keys: SshKeyPair,
}

/// User-supplied node pool. Private keys are keyed by node endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticNodePool {
    /// Private key per node public IP
    #[serde(default)]
    pub node_keys: BTreeMap<String, String>,
}

/// Provisioning kind, serialized under a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum NodePoolKind {
    /// Provisioned by the cloud provider
    Dynamic(DynamicNodePool),
    /// Brought by the operator
    Static(StaticNodePool),
}

/// A named group of identically configured nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name, unique within the cluster
    pub name: String,

    /// Pool hosts control-plane nodes
    #[serde(default)]
    pub control: bool,

    /// Dynamic or static, with the kind-specific settings
    pub kind: NodePoolKind,

    /// Nodes of the pool. Empty in a fresh manifest; filled by identity
    /// transfer.
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Labels applied to every node of the pool
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations applied to every node of the pool
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Taints applied to every node of the pool
    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Manifest name of the pool this one replaced in a rolling update.
    /// Unset for pools declared directly in the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl NodePool {
    /// Name the operator declared the pool under.
    pub fn manifest_name(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.name)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, NodePoolKind::Dynamic(_))
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, NodePoolKind::Static(_))
    }

    pub fn dynamic(&self) -> Option<&DynamicNodePool> {
        match &self.kind {
            NodePoolKind::Dynamic(d) => Some(d),
            NodePoolKind::Static(_) => None,
        }
    }

    pub fn dynamic_mut(&mut self) -> Option<&mut DynamicNodePool> {
        match &mut self.kind {
            NodePoolKind::Dynamic(d) => Some(d),
            NodePoolKind::Static(_) => None,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_by_ip(&self, ip: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.public_ip == ip)
    }

    pub fn has_api_endpoint(&self) -> bool {
        self.nodes.iter().any(Node::is_api_endpoint)
    }

    /// Template commit of a dynamic pool; `None` for static pools.
    pub fn template_commit(&self) -> Option<&str> {
        self.dynamic().map(|d| d.provider.template.commit_hash.as_str())
    }
}
