//! State-view projection
//!
//! Reduces a cluster to `{pool -> node names}` maps, split by pool kind.
//! The diff engine works on these projections only.

use fleet_model::{ClusterInfo, Clusters, Node, NodePool, NodePoolKind, NodeStatus, NodeType};
use std::collections::{BTreeMap, BTreeSet};

pub type PoolNodes = BTreeMap<String, BTreeSet<String>>;

/// Node names per pool, dynamic and static pools kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolView {
    pub dynamic: PoolNodes,
    pub static_: PoolNodes,
}

pub fn project(info: &ClusterInfo) -> PoolView {
    let mut view = PoolView::default();
    for pool in &info.node_pools {
        let names: BTreeSet<String> = pool.nodes.iter().map(|n| n.name.clone()).collect();
        match pool.kind {
            NodePoolKind::Dynamic(_) => view.dynamic.insert(pool.name.clone(), names),
            NodePoolKind::Static(_) => view.static_.insert(pool.name.clone(), names),
        };
    }
    view
}

/// Nodes flagged for deletion, per pool.
pub fn marked_for_deletion(info: &ClusterInfo) -> PoolNodes {
    info.node_pools
        .iter()
        .filter_map(|pool| {
            let marked: BTreeSet<String> = pool
                .nodes
                .iter()
                .filter(|n| n.is_marked_for_deletion())
                .map(|n| n.name.clone())
                .collect();
            (!marked.is_empty()).then(|| (pool.name.clone(), marked))
        })
        .collect()
}

/// Nodes flagged for deletion in both snapshots: deletions already
/// committed to, which the diff must carry out rather than undo.
pub fn pending_deletions(current: &ClusterInfo, desired: &ClusterInfo) -> PoolNodes {
    let desired_marked = marked_for_deletion(desired);
    marked_for_deletion(current)
        .into_iter()
        .filter_map(|(pool, nodes)| {
            let both: BTreeSet<String> = desired_marked
                .get(&pool)
                .map(|d| nodes.intersection(d).cloned().collect())
                .unwrap_or_default();
            (!both.is_empty()).then_some((pool, both))
        })
        .collect()
}

/// Copies the identity data that only exists once infrastructure is built
/// (node names and IPs, keys, CIDRs, cluster hash, kubeconfig) from
/// `current` into a copy of `desired`.
///
/// Dynamic pools are filled up to their target size: current nodes first,
/// then nodes already named in desired, then freshly named nodes. Static
/// nodes are matched by public IP. The template of `desired` is kept, so
/// template drift stays visible to the diff.
///
/// Applying the transfer to its own output changes nothing.
pub fn transfer_identity(current: &Clusters, desired: &Clusters) -> Clusters {
    let mut out = desired.clone();

    if let Some(des) = out.k8s.as_mut() {
        let cur = current.k8s.as_ref().filter(|c| c.info.name == des.info.name);
        if let Some(cur) = cur {
            if des.info.hash.is_empty() {
                des.info.hash = cur.info.hash.clone();
            }
            if des.kubeconfig.is_empty() {
                des.kubeconfig = cur.kubeconfig.clone();
            }
        }
        let id = des.id();
        transfer_pools(cur.map(|c| &c.info), &mut des.info.node_pools, &id);
    }

    for lb in out.load_balancers.iter_mut() {
        let cur = current.load_balancers.iter().find(|c| c.info.name == lb.info.name);
        if let Some(cur) = cur {
            if lb.info.hash.is_empty() {
                lb.info.hash = cur.info.hash.clone();
            }
            if let (Some(dns), Some(cur_dns)) = (lb.dns.as_mut(), cur.dns.as_ref()) {
                if dns.endpoint.is_empty() && !dns.differs_from(cur_dns) {
                    dns.endpoint = cur_dns.endpoint.clone();
                }
            }
        }
        let id = lb.id();
        transfer_pools(cur.map(|c| &c.info), &mut lb.info.node_pools, &id);
    }

    out
}

/// Current pool a desired pool inherits from: same name, or a sibling whose
/// recorded origin is that name. Name similarity alone never links pools.
fn matching_pool<'a>(current: &'a ClusterInfo, desired_name: &str, taken: &BTreeSet<&str>) -> Option<&'a NodePool> {
    current.pool(desired_name).or_else(|| {
        current
            .node_pools
            .iter()
            .filter(|p| p.origin.as_deref() == Some(desired_name))
            .filter(|p| !taken.contains(p.name.as_str()))
            .min_by(|a, b| a.name.cmp(&b.name))
    })
}

fn transfer_pools(current: Option<&ClusterInfo>, pools: &mut [NodePool], cluster_id: &str) {
    let declared: BTreeSet<String> = pools.iter().map(|p| p.name.clone()).collect();
    let declared_refs: BTreeSet<&str> = declared.iter().map(String::as_str).collect();

    for pool in pools.iter_mut() {
        let matched = current.and_then(|c| matching_pool(c, &pool.name, &declared_refs));
        if let Some(m) = matched {
            pool.name = m.name.clone();
            if pool.origin.is_none() {
                pool.origin = m.origin.clone();
            }
        }

        let node_type = if pool.control { NodeType::Master } else { NodeType::Worker };
        match &mut pool.kind {
            NodePoolKind::Dynamic(dynamic) => {
                if let Some(NodePoolKind::Dynamic(m)) = matched.map(|m| &m.kind) {
                    if dynamic.cidr.is_empty() {
                        dynamic.cidr = m.cidr.clone();
                    }
                    if dynamic.ssh_keys.is_empty() {
                        dynamic.ssh_keys = m.ssh_keys.clone();
                    }
                }
                let target = dynamic.autoscaler.as_ref().map_or(dynamic.count, |a| a.target_size) as usize;

                let mut nodes: Vec<Node> = matched.map(|m| m.nodes.iter().take(target).cloned().collect()).unwrap_or_default();
                for node in &pool.nodes {
                    if nodes.len() >= target {
                        break;
                    }
                    if !nodes.iter().any(|n| n.name == node.name) {
                        let mut node = node.clone();
                        if node.is_marked_for_deletion() {
                            node.status = NodeStatus::Preparing;
                        }
                        nodes.push(node);
                    }
                }
                while nodes.len() < target {
                    let name = next_node_name(cluster_id, &pool.name, &nodes);
                    nodes.push(Node::new(name, "", node_type));
                }
                pool.nodes = nodes;
            }
            NodePoolKind::Static(_) => {
                let mut named: Vec<Node> = Vec::with_capacity(pool.nodes.len());
                for node in &pool.nodes {
                    let mut node = node.clone();
                    match matched.and_then(|m| m.node_by_ip(&node.public_ip)) {
                        Some(existing) => {
                            node.name = existing.name.clone();
                            node.private_ip = existing.private_ip.clone();
                            node.node_type = existing.node_type;
                            node.status = existing.status;
                        }
                        None if node.name.is_empty() => {
                            node.name = next_node_name(cluster_id, &pool.name, &named);
                            node.node_type = node_type;
                        }
                        None => {}
                    }
                    named.push(node);
                }
                pool.nodes = named;
            }
        }
    }
}

/// `{cluster}-{pool}-{NN}` with the lowest index not used in `nodes`.
fn next_node_name(cluster_id: &str, pool: &str, nodes: &[Node]) -> String {
    (1..)
        .map(|i| format!("{cluster_id}-{pool}-{i:02}"))
        .find(|name| !nodes.iter().any(|n| &n.name == name))
        .unwrap_or_default()
}

/// Puts the API endpoint where a freshly created cluster needs it: on the
/// lowest-id ApiServer load balancer if there is one (no node holds it),
/// otherwise on the first control node, pools and nodes ordered by name.
pub fn place_api_endpoint(clusters: &mut Clusters) {
    let on_load_balancer = clusters.api_load_balancer().is_some();
    let Some(k8s) = clusters.k8s.as_mut() else {
        return;
    };

    if on_load_balancer {
        for node in k8s.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()) {
            if node.is_api_endpoint() {
                node.node_type = NodeType::Master;
            }
        }
        return;
    }
    if k8s.info.api_endpoint().is_some() {
        return;
    }

    let target = k8s
        .info
        .node_pools
        .iter_mut()
        .filter(|p| p.control && !p.nodes.is_empty())
        .min_by(|a, b| a.name.cmp(&b.name))
        .and_then(|p| p.nodes.iter_mut().min_by(|a, b| a.name.cmp(&b.name)));
    if let Some(node) = target {
        node.node_type = NodeType::ApiEndpoint;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_project_splits_by_kind() {
        let cluster = k8s(
            "prod",
            vec![
                dynamic_pool("control", true, &["c1"]),
                dynamic_pool("empty", false, &[]),
                static_pool("onprem", false, &["s1", "s2"]),
            ],
        );
        let view = project(&cluster.info);
        assert_eq!(view.dynamic.len(), 2);
        assert!(view.dynamic["empty"].is_empty());
        assert_eq!(view.static_["onprem"].len(), 2);
    }

    fn manifest_pool(name: &str, control: bool, count: u32) -> NodePool {
        let mut pool = dynamic_pool(name, control, &[]);
        if let Some(d) = pool.dynamic_mut() {
            d.count = count;
            d.cidr.clear();
            d.ssh_keys = Default::default();
        }
        pool
    }

    #[test]
    fn test_transfer_reuses_and_generates_names() {
        let current = clusters(k8s("prod", vec![dynamic_pool("compute", false, &["w1", "w2"])]), vec![]);
        let desired = clusters(k8s("prod", vec![manifest_pool("compute", false, 3)]), vec![]);

        let out = transfer_identity(&current, &desired);
        let pool = out.k8s.as_ref().unwrap().info.pool("compute").unwrap();
        let names: Vec<&str> = pool.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["w1", "w2", "prod-compute-01"]);
        assert_eq!(pool.nodes[0].public_ip, ip_of("w1"));
        assert_eq!(pool.dynamic().unwrap().ssh_keys.public_key, "pub-compute");
        assert!(!pool.dynamic().unwrap().cidr.is_empty());

        // a second pass is a no-op
        assert_eq!(transfer_identity(&current, &out), out);
    }

    #[test]
    fn test_transfer_shrinks_to_count_and_keeps_template() {
        let current = clusters(k8s("prod", vec![dynamic_pool("compute", false, &["w1", "w2"])]), vec![]);
        let desired = clusters(k8s("prod", vec![with_commit(manifest_pool("compute", false, 1), "beef")]), vec![]);

        let out = transfer_identity(&current, &desired);
        let pool = out.k8s.as_ref().unwrap().info.pool("compute").unwrap();
        assert_eq!(pool.nodes.len(), 1);
        assert_eq!(pool.template_commit(), Some("beef"));
    }

    #[test]
    fn test_transfer_matches_static_nodes_by_ip() {
        let current = clusters(k8s("prod", vec![static_pool("onprem", false, &["s1"])]), vec![]);
        let mut pool = static_pool("onprem", false, &["s1", "s2"]);
        for node in pool.nodes.iter_mut() {
            node.name.clear();
            node.private_ip.clear();
        }
        let desired = clusters(k8s("prod", vec![pool]), vec![]);

        let out = transfer_identity(&current, &desired);
        let pool = out.k8s.as_ref().unwrap().info.pool("onprem").unwrap();
        assert_eq!(pool.nodes[0].name, "s1");
        assert_eq!(pool.nodes[0].private_ip, current.k8s.as_ref().unwrap().info.node_pools[0].nodes[0].private_ip);
        assert_eq!(pool.nodes[1].name, "prod-onprem-01");
    }

    #[test]
    fn test_transfer_follows_rolled_sibling() {
        let mut sibling = dynamic_pool("compute-r00001", false, &["w9"]);
        sibling.origin = Some("compute".to_string());
        let current = clusters(k8s("prod", vec![sibling]), vec![]);
        let desired = clusters(k8s("prod", vec![manifest_pool("compute", false, 1)]), vec![]);

        let out = transfer_identity(&current, &desired);
        let pool = &out.k8s.as_ref().unwrap().info.node_pools[0];
        assert_eq!(pool.name, "compute-r00001");
        assert_eq!(pool.origin.as_deref(), Some("compute"));
        assert_eq!(pool.nodes[0].name, "w9");
        assert_eq!(transfer_identity(&current, &out), out);
    }

    #[test]
    fn test_transfer_never_links_pools_by_name_shape() {
        // "gpu-worker" looks like "gpu" plus a generated suffix but was declared by hand.
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("gpu-worker", false, &["g1"])]),
            vec![],
        );
        let desired = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), manifest_pool("gpu", false, 1)]),
            vec![],
        );

        let out = transfer_identity(&current, &desired);
        let info = &out.k8s.as_ref().unwrap().info;
        assert!(info.pool("gpu-worker").is_none());
        let gpu = info.pool("gpu").unwrap();
        assert!(gpu.origin.is_none());
        assert_eq!(gpu.nodes[0].name, "prod-gpu-01");
        assert!(gpu.dynamic().unwrap().ssh_keys.is_empty());
        assert!(gpu.dynamic().unwrap().cidr.is_empty());

        let diff = crate::diff::node_pools_diff(
            project(&current.k8s.as_ref().unwrap().info).dynamic,
            project(info).dynamic,
        );
        assert_eq!(diff.deleted.keys().collect::<Vec<_>>(), vec!["gpu-worker"]);
        assert_eq!(diff.added.keys().collect::<Vec<_>>(), vec!["gpu"]);
        assert!(diff.partially_added.is_empty() && diff.partially_deleted.is_empty());
    }

    #[test]
    fn test_pending_deletions_are_marked_on_both_sides() {
        let mut current = k8s(
            "prod",
            vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1", "w2"])],
        );
        let mut desired = current.clone();
        for node in current.info.node_pools[1].nodes.iter_mut() {
            node.status = NodeStatus::MarkedForDeletion;
        }
        desired.info.node_pools[1].nodes[0].status = NodeStatus::MarkedForDeletion;

        let pending = pending_deletions(&current.info, &desired.info);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["compute"].iter().collect::<Vec<_>>(), vec!["w1"]);
        assert!(pending_deletions(&desired.info, &k8s("prod", vec![]).info).is_empty());
    }

    #[test]
    fn test_place_api_endpoint_prefers_load_balancer() {
        let mut desired = clusters(
            k8s("prod", vec![dynamic_pool("b-control", true, &["b1"]), dynamic_pool("a-control", true, &["a2", "a1"])]),
            vec![],
        );
        set_api_endpoint(&mut desired, None);
        place_api_endpoint(&mut desired);
        let (pool, node) = desired.k8s.as_ref().unwrap().info.api_endpoint().unwrap();
        assert_eq!((pool.name.as_str(), node.name.as_str()), ("a-control", "a1"));

        desired.load_balancers.push(lb("lb1", "prod", vec![], vec![api_role(&["a-control"])]));
        place_api_endpoint(&mut desired);
        assert!(desired.k8s.as_ref().unwrap().info.api_endpoint().is_none());
    }
}
