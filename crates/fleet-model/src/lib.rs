//! FleetOps model
//!
//! Types shared by the reconciliation engine, the configuration store and
//! the controller: cluster snapshots, node pools, per-cluster state and the
//! task events handed to workers.

pub mod cluster;
pub mod node;
pub mod stage;
pub mod state;
pub mod task;

pub use cluster::*;
pub use node::*;
pub use stage::*;
pub use state::*;
pub use task::*;

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"
k8s:
  info:
    name: prod
    hash: ab12cd
    nodePools:
      - name: control-htz
        control: true
        kind:
          type: dynamic
          provider:
            name: hetzner-1
            cloudProvider: hetzner
            template:
              repository: https://github.com/microscaler/fleet-templates
              commitHash: 8f3c2a1
          region: fsn1
          count: 1
          cidr: 10.0.1.0/24
        nodes:
          - name: prod-ab12cd-control-htz-01
            publicIp: 192.0.2.10
            nodeType: apiEndpoint
      - name: onprem
        kind:
          type: static
          nodeKeys:
            192.0.2.50: key
        nodes:
          - name: onprem-01
            publicIp: 192.0.2.50
  kubernetesVersion: "1.31.0"
loadBalancers: []
"#;

    #[test]
    fn test_snapshot_yaml_roundtrip() {
        let clusters: Clusters = serde_yaml::from_str(SNAPSHOT).unwrap();
        let k8s = clusters.k8s.as_ref().unwrap();
        assert_eq!(k8s.id(), "prod-ab12cd");
        assert_eq!(k8s.info.node_pools.len(), 2);
        assert!(k8s.info.node_pools[0].is_dynamic());
        assert!(k8s.info.node_pools[1].is_static());

        let (pool, node) = k8s.info.api_endpoint().unwrap();
        assert_eq!(pool.name, "control-htz");
        assert_eq!(node.name, "prod-ab12cd-control-htz-01");

        let json = serde_json::to_string(&clusters).unwrap();
        let back: Clusters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, clusters);
    }

    #[test]
    fn test_cluster_state_removable() {
        let state = ClusterState::default();
        assert!(state.is_removable());

        let clusters: Clusters = serde_yaml::from_str(SNAPSHOT).unwrap();
        let state = ClusterState::new(clusters);
        assert!(!state.is_removable());
    }
}
