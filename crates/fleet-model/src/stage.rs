//! Stage vocabulary
//!
//! Stages and sub-passes are the contract consumed by the external worker
//! stages. The serialized names are wire-stable: new variants may only be
//! appended, existing names never change.

use serde::{Deserialize, Serialize};

/// How a failure inside a stage or sub-pass is treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    /// Failure aborts the task
    #[default]
    Fatal,
    /// Failure is logged and the pipeline continues
    Warn,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    /// Cloud infrastructure and DNS
    Provisioning,
    /// Node-level configuration over SSH (VPN, proxy, load balancers)
    Configuration,
    /// Kubernetes cluster bootstrap and membership
    ClusterBootstrap,
    /// In-cluster API calls
    ClusterConfiguration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SubPassKind {
    // Provisioning
    BuildInfrastructure,
    DestroyInfrastructure,
    ReconcileDns,
    DestroyDns,
    // Configuration
    InstallNodeRequirements,
    InstallVpn,
    UpdateProxyEnvs,
    CommitProxyEnvs,
    ReconcileLoadBalancers,
    UpdateApiEndpoint,
    RemoveUtilities,
    // ClusterBootstrap
    ReconcileCluster,
    DestroyCluster,
    // ClusterConfiguration
    DeleteNodes,
    PatchNodes,
    PatchKubeadmConfigMap,
    PatchClusterInfoConfigMap,
    PatchKubeProxyConfigMap,
    RestartNetworkPlugin,
    SetupStorage,
    StoreKubeconfig,
    StoreClusterMetadata,
    DeleteKubeconfig,
    DeleteClusterMetadata,
    DeployAutoscaler,
    DestroyAutoscaler,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageDescription {
    pub about: String,
    pub error_level: ErrorLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubPass {
    pub kind: SubPassKind,
    pub description: StageDescription,
}

impl SubPass {
    pub fn fatal(kind: SubPassKind, about: impl Into<String>) -> Self {
        Self {
            kind,
            description: StageDescription { about: about.into(), error_level: ErrorLevel::Fatal },
        }
    }

    pub fn warn(kind: SubPassKind, about: impl Into<String>) -> Self {
        Self {
            kind,
            description: StageDescription { about: about.into(), error_level: ErrorLevel::Warn },
        }
    }

    pub fn error_level(&self) -> ErrorLevel {
        self.description.error_level
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub kind: StageKind,
    pub description: StageDescription,
    pub sub_passes: Vec<SubPass>,
}

impl Stage {
    /// Builds a stage whose severity floor is the strictest of its sub-passes.
    pub fn new(kind: StageKind, about: impl Into<String>, sub_passes: Vec<SubPass>) -> Self {
        let error_level = sub_passes
            .iter()
            .map(SubPass::error_level)
            .min()
            .unwrap_or(ErrorLevel::Warn);
        Self {
            kind,
            description: StageDescription { about: about.into(), error_level },
            sub_passes,
        }
    }

    pub fn contains(&self, kind: SubPassKind) -> bool {
        self.sub_passes.iter().any(|s| s.kind == kind)
    }

    pub fn sub_pass_kinds(&self) -> Vec<SubPassKind> {
        self.sub_passes.iter().map(|s| s.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_floor_is_strictest_sub_pass() {
        let stage = Stage::new(
            StageKind::ClusterConfiguration,
            "patch",
            vec![
                SubPass::warn(SubPassKind::RestartNetworkPlugin, "restart"),
                SubPass::fatal(SubPassKind::PatchNodes, "patch"),
            ],
        );
        assert_eq!(stage.description.error_level, ErrorLevel::Fatal);

        let warn_only = Stage::new(
            StageKind::ClusterConfiguration,
            "cleanup",
            vec![SubPass::warn(SubPassKind::DeleteKubeconfig, "kubeconfig")],
        );
        assert_eq!(warn_only.description.error_level, ErrorLevel::Warn);
    }

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(serde_json::to_string(&StageKind::ClusterBootstrap).unwrap(), "\"clusterBootstrap\"");
        assert_eq!(serde_json::to_string(&SubPassKind::InstallVpn).unwrap(), "\"installVpn\"");
        assert_eq!(serde_json::to_string(&ErrorLevel::Warn).unwrap(), "\"WARN\"");
    }
}
