//! Load-balancer diff
//!
//! Load balancers are matched by id, never by list position. Each match is
//! recorded as a pair of [`LbIndex`] values that index into the snapshots
//! the diff borrows.

use super::nodepools::{NodePoolsDiff, node_pools_diff};
use crate::projection::{PoolNodes, pending_deletions, project};
use fleet_model::{ApiEndpointChange, LoadBalancerCluster};
use std::collections::{BTreeMap, BTreeSet};

/// Position of a load balancer inside one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbIndex {
    pub id: String,
    pub index: usize,
}

/// Changes between a matched pair of load balancers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerModification {
    pub current: LbIndex,
    pub desired: LbIndex,
    pub dns_changed: bool,
    pub roles_added: Vec<String>,
    pub roles_deleted: Vec<String>,
    /// Roles whose target port or proxy settings changed
    pub internal_settings: Vec<String>,
    /// Roles whose listener port or protocol changed
    pub external_settings: Vec<String>,
    /// role -> pools gained as targets
    pub target_pools_added: BTreeMap<String, Vec<String>>,
    /// role -> pools no longer targeted
    pub target_pools_deleted: BTreeMap<String, Vec<String>>,
    pub dynamic: NodePoolsDiff,
    pub static_: NodePoolsDiff,
    pub pending_deletions: PoolNodes,
}

impl LoadBalancerModification {
    pub fn is_empty(&self) -> bool {
        !self.dns_changed
            && self.roles_added.is_empty()
            && self.roles_deleted.is_empty()
            && self.internal_settings.is_empty()
            && self.external_settings.is_empty()
            && self.target_pools_added.is_empty()
            && self.target_pools_deleted.is_empty()
            && self.dynamic.is_empty()
            && self.static_.is_empty()
            && self.pending_deletions.is_empty()
    }

    pub fn node_changes(&self) -> bool {
        !self.dynamic.is_empty() || !self.static_.is_empty() || !self.pending_deletions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancersDiff<'a> {
    current: &'a [LoadBalancerCluster],
    desired: &'a [LoadBalancerCluster],
    pub added: Vec<LbIndex>,
    pub deleted: Vec<LbIndex>,
    pub modified: Vec<LoadBalancerModification>,
    pub api_endpoint: ApiEndpointChange,
}

impl<'a> LoadBalancersDiff<'a> {
    pub fn current(&self, index: &LbIndex) -> &'a LoadBalancerCluster {
        &self.current[index.index]
    }

    pub fn desired(&self, index: &LbIndex) -> &'a LoadBalancerCluster {
        &self.desired[index.index]
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.modified.is_empty()
            && self.api_endpoint == ApiEndpointChange::NoChange
    }
}

fn indexed(lbs: &[LoadBalancerCluster]) -> BTreeMap<String, usize> {
    lbs.iter().enumerate().map(|(index, lb)| (lb.id(), index)).collect()
}

pub fn load_balancers_diff<'a>(
    current: &'a [LoadBalancerCluster],
    desired: &'a [LoadBalancerCluster],
) -> LoadBalancersDiff<'a> {
    let current_ids = indexed(current);
    let desired_ids = indexed(desired);

    let deleted = current_ids
        .iter()
        .filter(|(id, _)| !desired_ids.contains_key(*id))
        .map(|(id, index)| LbIndex { id: id.clone(), index: *index })
        .collect();
    let added = desired_ids
        .iter()
        .filter(|(id, _)| !current_ids.contains_key(*id))
        .map(|(id, index)| LbIndex { id: id.clone(), index: *index })
        .collect();

    let modified = current_ids
        .iter()
        .filter_map(|(id, cur_index)| {
            let des_index = desired_ids.get(id)?;
            let modification = modification(
                LbIndex { id: id.clone(), index: *cur_index },
                &current[*cur_index],
                LbIndex { id: id.clone(), index: *des_index },
                &desired[*des_index],
            );
            (!modification.is_empty()).then_some(modification)
        })
        .collect();

    LoadBalancersDiff {
        current,
        desired,
        added,
        deleted,
        modified,
        api_endpoint: api_endpoint_change(current, desired),
    }
}

fn modification(
    current_index: LbIndex,
    current: &LoadBalancerCluster,
    desired_index: LbIndex,
    desired: &LoadBalancerCluster,
) -> LoadBalancerModification {
    let current_roles: BTreeSet<&str> = current.roles.iter().map(|r| r.name.as_str()).collect();
    let desired_roles: BTreeSet<&str> = desired.roles.iter().map(|r| r.name.as_str()).collect();

    let mut internal_settings = Vec::new();
    let mut external_settings = Vec::new();
    let mut target_pools_added = BTreeMap::new();
    let mut target_pools_deleted = BTreeMap::new();
    for name in current_roles.intersection(&desired_roles) {
        let (Some(old), Some(new)) = (current.role(name), desired.role(name)) else {
            continue;
        };
        if old.internal_settings_differ(new) {
            internal_settings.push(name.to_string());
        }
        if old.external_settings_differ(new) {
            external_settings.push(name.to_string());
        }
        let old_targets: BTreeSet<&String> = old.target_pools.iter().collect();
        let new_targets: BTreeSet<&String> = new.target_pools.iter().collect();
        let gained: Vec<String> = new_targets.difference(&old_targets).map(|p| (*p).clone()).collect();
        let lost: Vec<String> = old_targets.difference(&new_targets).map(|p| (*p).clone()).collect();
        if !gained.is_empty() {
            target_pools_added.insert(name.to_string(), gained);
        }
        if !lost.is_empty() {
            target_pools_deleted.insert(name.to_string(), lost);
        }
    }

    let dns_changed = match (&current.dns, &desired.dns) {
        (Some(old), Some(new)) => old.differs_from(new),
        (None, None) => false,
        _ => true,
    };

    // Dynamic and static projections are diffed independently.
    let old_view = project(&current.info);
    let new_view = project(&desired.info);
    let pending_deletions = pending_deletions(&current.info, &desired.info);

    LoadBalancerModification {
        current: current_index,
        desired: desired_index,
        dns_changed,
        roles_added: desired_roles.difference(&current_roles).map(|r| r.to_string()).collect(),
        roles_deleted: current_roles.difference(&desired_roles).map(|r| r.to_string()).collect(),
        internal_settings,
        external_settings,
        target_pools_added,
        target_pools_deleted,
        dynamic: node_pools_diff(old_view.dynamic, new_view.dynamic),
        static_: node_pools_diff(old_view.static_, new_view.static_),
        pending_deletions,
    }
}

fn api_load_balancer(lbs: &[LoadBalancerCluster]) -> Option<&LoadBalancerCluster> {
    lbs.iter().filter(|lb| lb.has_api_role()).min_by_key(|lb| lb.id())
}

/// Classifies how the API endpoint moves between load balancers. When
/// several load balancers carry the ApiServer role the lowest id wins.
pub fn api_endpoint_change(current: &[LoadBalancerCluster], desired: &[LoadBalancerCluster]) -> ApiEndpointChange {
    match (api_load_balancer(current), api_load_balancer(desired)) {
        (None, None) => ApiEndpointChange::NoChange,
        (None, Some(d)) => ApiEndpointChange::AttachingLoadBalancer { desired: d.id() },
        (Some(c), None) => ApiEndpointChange::DetachingLoadBalancer { current: c.id() },
        (Some(c), Some(d)) if c.id() != d.id() => ApiEndpointChange::MoveEndpoint { current: c.id(), desired: d.id() },
        (Some(c), Some(d)) => {
            let renamed = match (&c.dns, &d.dns) {
                (Some(old), Some(new)) => old.hostname != new.hostname || old.dns_zone != new.dns_zone,
                (None, None) => false,
                _ => true,
            };
            if renamed {
                ApiEndpointChange::EndpointRenamed { id: c.id() }
            } else {
                ApiEndpointChange::NoChange
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use fleet_model::NodePool;

    fn lb_with(name: &str, pools: Vec<NodePool>, roles: Vec<fleet_model::Role>) -> LoadBalancerCluster {
        lb(name, "prod", pools, roles)
    }

    #[test]
    fn test_matches_by_id_not_position() {
        let current = vec![lb_with("lb-a", vec![], vec![]), lb_with("lb-b", vec![], vec![])];
        let desired = vec![lb_with("lb-b", vec![], vec![]), lb_with("lb-a", vec![], vec![])];
        let diff = load_balancers_diff(&current, &desired);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_added_deleted_and_index_pairs() {
        let current = vec![lb_with("lb-a", vec![], vec![]), lb_with("lb-b", vec![], vec![ingress_role("web", &["w"])])];
        let desired = vec![lb_with("lb-c", vec![], vec![]), lb_with("lb-b", vec![], vec![ingress_role("web", &["w", "x"])])];
        let diff = load_balancers_diff(&current, &desired);

        assert_eq!(diff.deleted, vec![LbIndex { id: "lb-a".into(), index: 0 }]);
        assert_eq!(diff.added, vec![LbIndex { id: "lb-c".into(), index: 0 }]);
        assert_eq!(diff.modified.len(), 1);
        let m = &diff.modified[0];
        assert_eq!((m.current.index, m.desired.index), (1, 1));
        assert_eq!(diff.current(&m.current).id(), diff.desired(&m.desired).id());
        assert_eq!(m.target_pools_added["web"], vec!["x".to_string()]);
    }

    #[test]
    fn test_internal_and_external_settings_are_separate() {
        let old = ingress_role("web", &["w"]);
        let mut internal = old.clone();
        internal.target_port = 31443;
        let mut external = old.clone();
        external.port = 8443;

        let current = vec![lb_with("lb", vec![], vec![old.clone(), { let mut r = old.clone(); r.name = "alt".into(); r }])];
        let desired = vec![lb_with("lb", vec![], vec![internal, { let mut r = external; r.name = "alt".into(); r }])];
        let diff = load_balancers_diff(&current, &desired);
        let m = &diff.modified[0];
        assert_eq!(m.internal_settings, vec!["web".to_string()]);
        assert_eq!(m.external_settings, vec!["alt".to_string()]);
    }

    #[test]
    fn test_static_diff_independent_of_dynamic() {
        let current = vec![lb_with("lb", vec![dynamic_pool("dyn", false, &["d1"]), static_pool("st", false, &["s1"])], vec![])];
        let desired = vec![lb_with("lb", vec![dynamic_pool("dyn", false, &["d1", "d2"]), static_pool("st", false, &[])], vec![])];
        let diff = load_balancers_diff(&current, &desired);
        let m = &diff.modified[0];
        assert_eq!(m.dynamic.partially_added.len(), 1);
        assert!(m.dynamic.partially_deleted.is_empty());
        assert_eq!(m.static_.partially_deleted.len(), 1);
        assert!(m.static_.partially_added.is_empty());
    }

    #[test]
    fn test_dns_change_detection() {
        let current = vec![lb_with("lb", vec![], vec![])];
        let mut desired = current.clone();
        if let Some(dns) = desired[0].dns.as_mut() {
            dns.endpoint = "something-else.example.com".into();
        }
        assert!(load_balancers_diff(&current, &desired).modified.is_empty());

        if let Some(dns) = desired[0].dns.as_mut() {
            dns.provider.name = "other-account".into();
        }
        assert!(load_balancers_diff(&current, &desired).modified[0].dns_changed);
    }

    #[test]
    fn test_api_endpoint_state_machine() {
        let plain = lb_with("lb-a", vec![], vec![]);
        let api_a = lb_with("lb-a", vec![], vec![api_role(&["control"])]);
        let api_b = lb_with("lb-b", vec![], vec![api_role(&["control"])]);
        let api_c = lb_with("lb-c", vec![], vec![api_role(&["control"])]);

        assert_eq!(api_endpoint_change(&[plain.clone()], &[plain.clone()]), ApiEndpointChange::NoChange);
        assert_eq!(
            api_endpoint_change(&[plain.clone()], &[api_a.clone()]),
            ApiEndpointChange::AttachingLoadBalancer { desired: "lb-a".into() }
        );
        assert_eq!(
            api_endpoint_change(&[api_a.clone()], &[plain]),
            ApiEndpointChange::DetachingLoadBalancer { current: "lb-a".into() }
        );
        assert_eq!(
            api_endpoint_change(&[api_a.clone()], &[api_b.clone()]),
            ApiEndpointChange::MoveEndpoint { current: "lb-a".into(), desired: "lb-b".into() }
        );
        // lowest id wins among several ApiServer load balancers
        assert_eq!(api_endpoint_change(&[api_a.clone()], &[api_c, api_b.clone(), api_a.clone()]), ApiEndpointChange::NoChange);

        let mut renamed = api_a.clone();
        if let Some(dns) = renamed.dns.as_mut() {
            dns.hostname = "api".into();
        }
        assert_eq!(
            api_endpoint_change(&[api_a], &[renamed]),
            ApiEndpointChange::EndpointRenamed { id: "lb-a".into() }
        );
    }
}
