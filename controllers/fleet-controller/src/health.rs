//! Reachability probe backing the engine's health oracle.
//!
//! A node is reachable when a TCP connection to its public IP on the probe
//! port succeeds within the timeout. Live node listings come from the
//! cluster's own API server, reached with the kubeconfig stored in the
//! snapshot.

use futures::future::join_all;
use fleet_model::{K8sCluster, Node};
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use reconcile_engine::{HealthOracle, OracleError};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClusterProbe {
    port: u16,
    timeout: Duration,
}

impl ClusterProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn reachable(&self, ip: &str) -> bool {
        match timeout(self.timeout, TcpStream::connect((ip, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{}:{} refused: {}", ip, self.port, e);
                false
            }
            Err(_) => {
                debug!("{}:{} timed out", ip, self.port);
                false
            }
        }
    }

    async fn client_for(&self, cluster: &K8sCluster) -> Result<Client, OracleError> {
        if cluster.kubeconfig.trim().is_empty() {
            return Err(OracleError::Unavailable(format!("cluster {} has no kubeconfig yet", cluster.id())));
        }
        let kubeconfig = Kubeconfig::from_yaml(&cluster.kubeconfig)
            .map_err(|e| OracleError::Unavailable(format!("kubeconfig of {}: {e}", cluster.id())))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| OracleError::Unavailable(format!("kubeconfig of {}: {e}", cluster.id())))?;
        Client::try_from(config).map_err(|e| OracleError::Unavailable(format!("client for {}: {e}", cluster.id())))
    }
}

#[async_trait::async_trait]
impl HealthOracle for ClusterProbe {
    async fn ping(&self, ips: &[String]) -> Result<BTreeSet<String>, OracleError> {
        let results = join_all(ips.iter().map(|ip| async move { (ip, self.reachable(ip).await) })).await;
        Ok(results
            .into_iter()
            .filter(|(_, reachable)| !reachable)
            .map(|(ip, _)| ip.clone())
            .collect())
    }

    async fn live_cluster_node_names(&self, cluster: &K8sCluster) -> Result<BTreeSet<String>, OracleError> {
        let client = self.client_for(cluster).await?;
        let nodes: Api<KubeNode> = Api::all(client);
        let listed = timeout(self.timeout, nodes.list(&ListParams::default()))
            .await
            .map_err(|_| OracleError::Timeout(format!("listing nodes of {}", cluster.id())))?
            .map_err(|e| OracleError::Unavailable(format!("listing nodes of {}: {e}", cluster.id())))?;
        Ok(listed.items.into_iter().filter_map(|n| n.metadata.name).collect())
    }

    async fn vpn_peer_count(&self, node: &Node) -> Result<usize, OracleError> {
        Err(OracleError::Unsupported(format!("vpn peers of {}", node.name)))
    }
}
