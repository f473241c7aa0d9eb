//! Placement matcher
//!
//! Combines filtered candidates into plans and ranks them. Without a
//! bandwidth request a single plan is built from the filtered clusters;
//! with one, every network topology yields its own plan.

use super::filter::{HostsByCluster, TopologyMap};
use crate::models::{
    Cluster, Conditions, HostBrief, Network, RemoteStorage, StorageSpec, StorageType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Topology label used by the single no-bandwidth plan
pub const DEFAULT_TOPOLOGY: &str = "default";

/// A cluster, an optional network on it, and the usable hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matches {
    pub cluster: Cluster,
    pub network: Option<Network>,
    pub hosts: Vec<HostBrief>,
}

/// A candidate placement solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub topology: String,
    pub group: Vec<Matches>,
}

impl Plan {
    /// Hosts across all groups, de-duplicated by id in group order
    pub fn hosts(&self) -> Vec<HostBrief> {
        let mut seen = BTreeSet::new();
        self.group
            .iter()
            .flat_map(|m| m.hosts.iter())
            .filter(|h| seen.insert(h.id.clone()))
            .cloned()
            .collect()
    }

    /// Number of distinct physical hosts by IP address
    pub fn distinct_ips(&self) -> usize {
        self.group
            .iter()
            .flat_map(|m| m.hosts.iter().map(|h| h.ip.as_str()))
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn distinct_clusters(&self) -> usize {
        self.group
            .iter()
            .map(|m| m.cluster.id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn distinct_networks(&self) -> usize {
        self.group
            .iter()
            .filter_map(|m| m.network.as_ref().map(|n| n.id.as_str()))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// The group a host was matched through
    pub fn matches_for(&self, host_id: &str) -> Option<&Matches> {
        self.group
            .iter()
            .find(|m| m.hosts.iter().any(|h| h.id == host_id))
    }
}

/// Filtered candidates for one request
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub clusters: Vec<Cluster>,
    pub networks: TopologyMap,
    pub hosts: HostsByCluster,
    pub storages: Vec<RemoteStorage>,
}

/// Request parameters the matcher needs
#[derive(Debug, Clone, Copy)]
pub struct MatchParams<'a> {
    pub replicas: u32,
    pub bandwidth: Option<u32>,
    pub storage: Option<&'a StorageSpec>,
    pub conditions: &'a Conditions,
}

/// Build and rank plans
///
/// Plans violating a declared HA condition are dropped. The rest are
/// ordered by group count, then by distinct host addresses, both
/// descending; the sorts are stable so input order breaks remaining ties.
pub fn match_plans(candidates: &Candidates, params: MatchParams<'_>) -> Vec<Plan> {
    let mut plans = match params.bandwidth {
        None => vec![single_plan(candidates, params)],
        Some(bandwidth) => candidates
            .networks
            .iter()
            .map(|(topology, networks)| topology_plan(candidates, params, topology, networks, bandwidth))
            .collect(),
    };

    plans.retain(|plan| acceptable(plan, params));
    for plan in &mut plans {
        plan.group.sort_by(|a, b| b.hosts.len().cmp(&a.hosts.len()));
    }
    plans.sort_by(|a, b| {
        b.group
            .len()
            .cmp(&a.group.len())
            .then_with(|| b.distinct_ips().cmp(&a.distinct_ips()))
    });
    plans
}

fn single_plan(candidates: &Candidates, params: MatchParams<'_>) -> Plan {
    let group = candidates
        .clusters
        .iter()
        .filter_map(|cluster| {
            let hosts = compatible_hosts(candidates, cluster, params.storage);
            if hosts.is_empty() {
                return None;
            }
            let network = candidates
                .networks
                .values()
                .flatten()
                .find(|n| n.cluster_id == cluster.id)
                .cloned();
            Some(Matches {
                cluster: cluster.clone(),
                network,
                hosts,
            })
        })
        .collect();

    Plan {
        topology: DEFAULT_TOPOLOGY.to_string(),
        group,
    }
}

fn topology_plan(
    candidates: &Candidates,
    params: MatchParams<'_>,
    topology: &str,
    networks: &[Network],
    bandwidth: u32,
) -> Plan {
    let group = networks
        .iter()
        .filter(|n| n.bandwidth_mbps >= bandwidth)
        .filter_map(|network| {
            let cluster = candidates
                .clusters
                .iter()
                .find(|c| c.id == network.cluster_id)?;
            let hosts = compatible_hosts(candidates, cluster, params.storage);
            if hosts.is_empty() {
                return None;
            }
            Some(Matches {
                cluster: cluster.clone(),
                network: Some(network.clone()),
                hosts,
            })
        })
        .collect();

    Plan {
        topology: topology.to_string(),
        group,
    }
}

/// Hosts of `cluster` that can serve the requested storage
fn compatible_hosts(
    candidates: &Candidates,
    cluster: &Cluster,
    storage: Option<&StorageSpec>,
) -> Vec<HostBrief> {
    let Some(hosts) = candidates.hosts.get(&cluster.id) else {
        return Vec::new();
    };
    hosts
        .iter()
        .filter(|host| match storage {
            None => true,
            Some(spec) if spec.kind == StorageType::Host => host.levels.contains(&spec.level),
            Some(_) => host
                .remote_storages
                .iter()
                .any(|id| candidates.storages.iter().any(|s| &s.id == id)),
        })
        .cloned()
        .collect()
}

fn acceptable(plan: &Plan, params: MatchParams<'_>) -> bool {
    let conditions = params.conditions;
    if plan.group.is_empty() {
        return false;
    }
    if conditions.network.high_availability && plan.distinct_networks() < 2 {
        return false;
    }
    if conditions.cluster.high_availability && plan.distinct_clusters() < 2 {
        return false;
    }
    if conditions.host.high_availability && plan.hosts().len() < params.replicas as usize {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, StorageLevel};

    fn cluster(id: &str) -> Cluster {
        Cluster {
            id: id.into(),
            name: id.into(),
            site_id: "s1".into(),
            images: vec!["mysql-8.0".into()],
            enabled: true,
        }
    }

    fn network(id: &str, cluster: &str, bandwidth: u32) -> Network {
        Network {
            id: id.into(),
            name: id.into(),
            cluster_id: cluster.into(),
            topology: vec![],
            bandwidth_mbps: bandwidth,
            enabled: true,
        }
    }

    fn host(id: &str, cluster: &str, ip: &str, levels: Vec<StorageLevel>) -> HostBrief {
        HostBrief {
            id: id.into(),
            name: id.into(),
            ip: ip.into(),
            cluster_id: cluster.into(),
            cpu_free: 4000,
            memory_free: 8192,
            medium_free: 1000,
            high_free: 1000,
            pod_free: 10,
            levels,
            remote_storages: vec![],
            unschedulable: false,
        }
    }

    fn params<'a>(conditions: &'a Conditions, bandwidth: Option<u32>) -> MatchParams<'a> {
        MatchParams {
            replicas: 2,
            bandwidth,
            storage: None,
            conditions,
        }
    }

    #[test]
    fn test_plan_with_more_groups_ranks_first() {
        let mut candidates = Candidates::default();
        for c in ["c1", "c2", "c3"] {
            candidates.clusters.push(cluster(c));
            candidates
                .hosts
                .insert(c.into(), vec![host(&format!("{c}-h"), c, &format!("ip-{c}"), vec![])]);
        }
        // "small" spans two clusters, "wide" spans three
        candidates.networks.insert(
            "small".into(),
            vec![network("n1", "c1", 100), network("n2", "c2", 100)],
        );
        candidates.networks.insert(
            "wide".into(),
            vec![
                network("n3", "c1", 100),
                network("n4", "c2", 100),
                network("n5", "c3", 100),
            ],
        );

        let conditions = Conditions::default();
        let plans = match_plans(&candidates, params(&conditions, Some(10)));
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].topology, "wide");
        assert_eq!(plans[0].group.len(), 3);
        assert_eq!(plans[1].group.len(), 2);
    }

    #[test]
    fn test_ties_break_on_distinct_host_ips() {
        let mut candidates = Candidates::default();
        candidates.clusters.push(cluster("c1"));
        candidates.clusters.push(cluster("c2"));
        candidates
            .hosts
            .insert("c1".into(), vec![host("h1", "c1", "10.0.0.1", vec![])]);
        candidates.hosts.insert(
            "c2".into(),
            vec![
                host("h2", "c2", "10.0.0.2", vec![]),
                host("h3", "c2", "10.0.0.3", vec![]),
            ],
        );
        candidates
            .networks
            .insert("a".into(), vec![network("n1", "c1", 100)]);
        candidates
            .networks
            .insert("b".into(), vec![network("n2", "c2", 100)]);

        let conditions = Conditions::default();
        let plans = match_plans(&candidates, params(&conditions, Some(10)));
        assert_eq!(plans[0].topology, "b");
    }

    #[test]
    fn test_host_storage_level_filters_hosts() {
        let mut candidates = Candidates::default();
        candidates.clusters.push(cluster("c1"));
        candidates.hosts.insert(
            "c1".into(),
            vec![
                host("h1", "c1", "10.0.0.1", vec![StorageLevel::Medium]),
                host("h2", "c1", "10.0.0.2", vec![StorageLevel::High]),
            ],
        );
        let storage = StorageSpec {
            kind: StorageType::Host,
            level: StorageLevel::High,
            size_mib: 10,
        };
        let conditions = Conditions::default();
        let plans = match_plans(
            &candidates,
            MatchParams {
                replicas: 1,
                bandwidth: None,
                storage: Some(&storage),
                conditions: &conditions,
            },
        );

        assert_eq!(plans.len(), 1);
        let hosts = plans[0].hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id, "h2");
    }

    #[test]
    fn test_cluster_ha_rejects_single_cluster_plan() {
        let mut candidates = Candidates::default();
        candidates.clusters.push(cluster("c1"));
        candidates.hosts.insert(
            "c1".into(),
            vec![
                host("h1", "c1", "10.0.0.1", vec![]),
                host("h2", "c1", "10.0.0.2", vec![]),
            ],
        );
        let conditions = Conditions {
            cluster: Condition::ha(),
            ..Default::default()
        };

        assert!(match_plans(&candidates, params(&conditions, None)).is_empty());
    }

    #[test]
    fn test_network_bandwidth_below_request_is_skipped() {
        let mut candidates = Candidates::default();
        candidates.clusters.push(cluster("c1"));
        candidates
            .hosts
            .insert("c1".into(), vec![host("h1", "c1", "10.0.0.1", vec![])]);
        candidates
            .networks
            .insert("slow".into(), vec![network("n1", "c1", 100)]);

        let conditions = Conditions::default();
        assert!(match_plans(&candidates, params(&conditions, Some(1000))).is_empty());
    }
}
