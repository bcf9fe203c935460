//! Fixtures for building snapshots in tests

use fleet_model::*;

pub use crate::health::StaticOracle;
pub use crate::identity::SequentialIdentity;
pub use crate::metrics::RecordingMetrics;

pub const COMMIT: &str = "c0ffee1";

/// Public IP used by the fixtures for a node name.
pub fn ip_of(node: &str) -> String {
    format!("ip-{node}")
}

fn fixture_nodes(control: bool, names: &[&str]) -> Vec<Node> {
    let node_type = if control { NodeType::Master } else { NodeType::Worker };
    names
        .iter()
        .map(|name| Node {
            status: NodeStatus::Ready,
            private_ip: format!("192.168.2.{}", name.len()),
            ..Node::new(*name, ip_of(name), node_type)
        })
        .collect()
}

pub fn dynamic_pool(name: &str, control: bool, nodes: &[&str]) -> NodePool {
    NodePool {
        name: name.to_string(),
        control,
        kind: NodePoolKind::Dynamic(DynamicNodePool {
            provider: Provider {
                name: "hetzner-1".to_string(),
                cloud_provider: "hetzner".to_string(),
                template: TemplateRepository {
                    repository: "https://github.com/microscaler/fleet-templates".to_string(),
                    tag: None,
                    commit_hash: COMMIT.to_string(),
                    path: "templates/hetzner".to_string(),
                },
            },
            region: "fsn1".to_string(),
            zone: "fsn1-dc14".to_string(),
            server_type: "cpx21".to_string(),
            image: "ubuntu-24.04".to_string(),
            storage_disk_size: 50,
            count: nodes.len() as u32,
            autoscaler: None,
            cidr: format!("10.0.{}.0/24", name.len()),
            ssh_keys: SshKeyPair { public_key: format!("pub-{name}"), private_key: format!("priv-{name}") },
        }),
        nodes: fixture_nodes(control, nodes),
        labels: Default::default(),
        annotations: Default::default(),
        taints: Vec::new(),
        origin: None,
    }
}

pub fn static_pool(name: &str, control: bool, nodes: &[&str]) -> NodePool {
    NodePool {
        name: name.to_string(),
        control,
        kind: NodePoolKind::Static(StaticNodePool {
            node_keys: nodes.iter().map(|n| (ip_of(n), format!("key-{n}"))).collect(),
        }),
        nodes: fixture_nodes(control, nodes),
        labels: Default::default(),
        annotations: Default::default(),
        taints: Vec::new(),
        origin: None,
    }
}

/// Cluster whose first control node holds the API endpoint.
pub fn k8s(name: &str, pools: Vec<NodePool>) -> K8sCluster {
    let mut cluster = K8sCluster {
        info: ClusterInfo { name: name.to_string(), hash: String::new(), node_pools: pools },
        kubernetes_version: "1.31.0".to_string(),
        network: "192.168.2.0/24".to_string(),
        kubeconfig: String::new(),
        proxy: None,
    };
    if let Some(node) = cluster
        .info
        .node_pools
        .iter_mut()
        .filter(|p| p.control)
        .find_map(|p| p.nodes.first_mut())
    {
        node.node_type = NodeType::ApiEndpoint;
    }
    cluster
}

pub fn lb(name: &str, target_k8s: &str, pools: Vec<NodePool>, roles: Vec<Role>) -> LoadBalancerCluster {
    LoadBalancerCluster {
        info: ClusterInfo { name: name.to_string(), hash: String::new(), node_pools: pools },
        roles,
        dns: Some(Dns {
            dns_zone: "example.com".to_string(),
            hostname: name.to_string(),
            provider: Provider { name: "cf".to_string(), cloud_provider: "cloudflare".to_string(), ..Default::default() },
            endpoint: format!("{name}.example.com"),
            alternative_names: Vec::new(),
        }),
        target_k8s: target_k8s.to_string(),
    }
}

pub fn api_role(target_pools: &[&str]) -> Role {
    Role {
        name: "api-server".to_string(),
        protocol: "tcp".to_string(),
        port: 6443,
        target_port: 6443,
        target_pools: target_pools.iter().map(|p| p.to_string()).collect(),
        role_type: RoleType::ApiServer,
        settings: RoleSettings::default(),
    }
}

pub fn ingress_role(name: &str, target_pools: &[&str]) -> Role {
    Role {
        name: name.to_string(),
        protocol: "tcp".to_string(),
        port: 443,
        target_port: 30443,
        target_pools: target_pools.iter().map(|p| p.to_string()).collect(),
        role_type: RoleType::Ingress,
        settings: RoleSettings::default(),
    }
}

pub fn clusters(k8s: K8sCluster, load_balancers: Vec<LoadBalancerCluster>) -> Clusters {
    Clusters { k8s: Some(k8s), load_balancers }
}

/// Moves the node-level API endpoint to `pool`/`node`, or clears it.
pub fn set_api_endpoint(clusters: &mut Clusters, target: Option<(&str, &str)>) {
    if let Some(k8s) = clusters.k8s.as_mut() {
        for pool in &mut k8s.info.node_pools {
            for node in &mut pool.nodes {
                if node.node_type == NodeType::ApiEndpoint {
                    node.node_type = NodeType::Master;
                }
                if target == Some((pool.name.as_str(), node.name.as_str())) {
                    node.node_type = NodeType::ApiEndpoint;
                }
            }
        }
    }
}

pub fn with_commit(mut pool: NodePool, commit: &str) -> NodePool {
    if let Some(d) = pool.dynamic_mut() {
        d.provider.template.commit_hash = commit.to_string();
    }
    pool
}

/// Cluster state with both snapshots settled and nothing in flight.
pub fn settled(current: Clusters, desired: Clusters) -> ClusterState {
    ClusterState { current, desired, ..Default::default() }
}
