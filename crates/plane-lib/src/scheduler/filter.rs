//! Candidate filters
//!
//! Each filter narrows one catalog dimension down to the entities that
//! satisfy a request's candidate whitelist and high-availability count.
//! Candidate ids that cannot be resolved are dropped silently.

use crate::catalog::{ClusterGetter, HostGetter, NetworkGetter, PoolGetter, StorageGetter};
use crate::models::{
    selector, Cluster, Condition, HostBrief, Network, RemoteStorage, Selector, StorageSpec,
    StorageType,
};
use crate::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Network groups keyed by topology tag
pub type TopologyMap = BTreeMap<String, Vec<Network>>;

/// Host briefs grouped by cluster id
pub type HostsByCluster = BTreeMap<String, Vec<HostBrief>>;

/// Clusters that accept `image`
pub async fn filter_clusters(
    getter: &dyn ClusterGetter,
    condition: &Condition,
    image: &str,
) -> Result<Vec<Cluster>> {
    let clusters = if condition.candidates.is_empty() {
        getter.list_clusters(&Selector::new()).await?
    } else {
        let mut found = Vec::with_capacity(condition.candidates.len());
        for id in &condition.candidates {
            match getter.get_cluster(id).await {
                Ok(cluster) => found.push(cluster),
                Err(e) if e.is_not_found() => debug!(cluster = %id, "Dropping unknown candidate"),
                Err(e) => return Err(e),
            }
        }
        found
    };

    let matched: Vec<Cluster> = clusters
        .into_iter()
        .filter(|c| c.enabled && c.accepts(image))
        .collect();

    if matched.is_empty() || (condition.high_availability && matched.len() < 2) {
        return Err(Error::validation(format!(
            "no cluster matched: image {image}, {} candidates, high availability {}",
            matched.len(),
            condition.high_availability
        )));
    }
    Ok(matched)
}

/// Networks grouped by topology tag
///
/// Untagged networks form a group of their own keyed by their id. With
/// high availability set, groups with fewer than two networks are dropped.
pub async fn filter_networks(
    getter: &dyn NetworkGetter,
    condition: &Condition,
) -> Result<TopologyMap> {
    let networks = if condition.candidates.is_empty() {
        getter.list_networks(&Selector::new()).await?
    } else {
        let mut found = Vec::with_capacity(condition.candidates.len());
        for id in &condition.candidates {
            match getter.get_network(id).await {
                Ok(network) => found.push(network),
                Err(e) if e.is_not_found() => debug!(network = %id, "Dropping unknown candidate"),
                Err(e) => return Err(e),
            }
        }
        found
    };

    let mut topologies = TopologyMap::new();
    for network in networks.into_iter().filter(|n| n.enabled) {
        if network.topology.is_empty() {
            topologies
                .entry(network.id.clone())
                .or_default()
                .push(network);
        } else {
            for tag in &network.topology {
                topologies
                    .entry(tag.clone())
                    .or_default()
                    .push(network.clone());
            }
        }
    }

    if condition.high_availability {
        topologies.retain(|_, group| group.len() >= 2);
    }

    if topologies.is_empty() {
        return Err(Error::validation("no network matched"));
    }
    Ok(topologies)
}

/// Schedulable hosts grouped by cluster
pub async fn filter_hosts(
    getter: &dyn HostGetter,
    condition: &Condition,
    replicas: u32,
) -> Result<HostsByCluster> {
    let hosts = if condition.candidates.is_empty() {
        getter.list_hosts(&Selector::new()).await?
    } else {
        let mut found = Vec::with_capacity(condition.candidates.len());
        for id in &condition.candidates {
            match getter.get_host(id).await {
                Ok(host) => found.push(host),
                Err(e) if e.is_not_found() => debug!(host = %id, "Dropping unknown candidate"),
                Err(e) => return Err(e),
            }
        }
        found
    };

    let mut grouped = HostsByCluster::new();
    let mut total = 0u32;
    for host in hosts {
        if !host.enabled || host.unschedulable {
            continue;
        }
        total += 1;
        grouped
            .entry(host.cluster_id.clone())
            .or_default()
            .push(host.brief());
    }

    if condition.high_availability && total < replicas {
        return Err(Error::validation(format!(
            "no host matched: {total} hosts for {replicas} replicas with high availability"
        )));
    }
    if grouped.is_empty() {
        return Err(Error::validation("no host matched"));
    }
    Ok(grouped)
}

/// Remote storages able to serve `storage`
///
/// Returns an empty list without error for host-local or absent storage.
pub async fn filter_remote_storages(
    storages: &dyn StorageGetter,
    pools: &dyn PoolGetter,
    condition: &Condition,
    storage: Option<&StorageSpec>,
) -> Result<Vec<RemoteStorage>> {
    let spec = match storage {
        Some(spec) if spec.kind == StorageType::Remote => spec,
        _ => return Ok(Vec::new()),
    };

    let candidates = if condition.candidates.is_empty() {
        storages.list_storages(&Selector::new()).await?
    } else {
        let mut found = Vec::with_capacity(condition.candidates.len());
        for id in &condition.candidates {
            match storages.get_storage(id).await {
                Ok(storage) => found.push(storage),
                Err(e) if e.is_not_found() => debug!(storage = %id, "Dropping unknown candidate"),
                Err(e) => return Err(e),
            }
        }
        found
    };

    let level = spec.level.to_string();
    let mut matched = Vec::new();
    for storage in candidates.into_iter().filter(|s| s.enabled) {
        let tier_pools = pools
            .list_pools(&selector([
                ("storage_id", storage.id.as_str()),
                ("level", level.as_str()),
                ("enabled", "true"),
            ]))
            .await?;
        if !tier_pools.is_empty() {
            matched.push(storage);
        }
    }

    if matched.is_empty() || (condition.high_availability && matched.len() < 2) {
        return Err(Error::validation(format!(
            "no remote storage matched: level {level}, {} candidates, high availability {}",
            matched.len(),
            condition.high_availability
        )));
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntity, MemoryCatalog};
    use crate::models::{Host, HostUsage, Pool, StorageLevel};

    fn cluster(id: &str, images: &[&str]) -> CatalogEntity {
        CatalogEntity::Cluster(Cluster {
            id: id.into(),
            name: id.into(),
            site_id: "s1".into(),
            images: images.iter().map(|i| i.to_string()).collect(),
            enabled: true,
        })
    }

    fn network(id: &str, cluster: &str, topology: &[&str]) -> CatalogEntity {
        CatalogEntity::Network(Network {
            id: id.into(),
            name: id.into(),
            cluster_id: cluster.into(),
            topology: topology.iter().map(|t| t.to_string()).collect(),
            bandwidth_mbps: 1000,
            enabled: true,
        })
    }

    fn host(id: &str, cluster: &str, unschedulable: bool) -> CatalogEntity {
        CatalogEntity::Host(Host {
            id: id.into(),
            name: id.into(),
            ip: format!("10.0.0.{}", id.len()),
            cluster_id: cluster.into(),
            cpu_milli: 4000,
            memory_mib: 8192,
            max_pods: 10,
            volumes: vec![],
            remote_storages: vec![],
            usage: HostUsage::default(),
            unschedulable,
            enabled: true,
        })
    }

    #[tokio::test]
    async fn test_cluster_filter_drops_unknown_and_incompatible() {
        let catalog = MemoryCatalog::with_entities([
            cluster("c1", &["mysql-8.0"]),
            cluster("c2", &["mysql-5.7"]),
        ]);
        let condition = Condition {
            candidates: vec!["c1".into(), "c2".into(), "ghost".into()],
            high_availability: false,
        };

        let clusters = filter_clusters(&catalog, &condition, "mysql-8.0")
            .await
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "c1");
    }

    #[tokio::test]
    async fn test_cluster_filter_high_availability_needs_two() {
        let catalog = MemoryCatalog::with_entities([
            cluster("c1", &["mysql-8.0"]),
            cluster("c2", &["mysql-5.7"]),
        ]);

        let err = filter_clusters(&catalog, &Condition::ha(), "mysql-8.0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no cluster matched"));
    }

    #[tokio::test]
    async fn test_network_filter_groups_by_topology() {
        let catalog = MemoryCatalog::with_entities([
            network("n1", "c1", &["east"]),
            network("n2", "c2", &["east"]),
            network("n3", "c1", &[]),
        ]);

        let all = filter_networks(&catalog, &Condition::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["east"].len(), 2);
        assert_eq!(all["n3"].len(), 1);

        let ha = filter_networks(&catalog, &Condition::ha()).await.unwrap();
        assert_eq!(ha.keys().collect::<Vec<_>>(), vec!["east"]);
    }

    #[tokio::test]
    async fn test_host_filter_skips_unschedulable() {
        let catalog = MemoryCatalog::with_entities([
            host("h1", "c1", false),
            host("h2", "c1", true),
            host("h3", "c2", false),
        ]);

        let grouped = filter_hosts(&catalog, &Condition::default(), 3)
            .await
            .unwrap();
        assert_eq!(grouped["c1"].len(), 1);
        assert_eq!(grouped["c2"].len(), 1);

        let err = filter_hosts(&catalog, &Condition::ha(), 3).await.unwrap_err();
        assert!(err.to_string().contains("no host matched"));
    }

    #[tokio::test]
    async fn test_remote_storage_filter_is_noop_for_host_storage() {
        let catalog = MemoryCatalog::new();
        let spec = StorageSpec {
            kind: StorageType::Host,
            level: StorageLevel::High,
            size_mib: 100,
        };
        let storages = filter_remote_storages(&catalog, &catalog, &Condition::ha(), Some(&spec))
            .await
            .unwrap();
        assert!(storages.is_empty());
    }

    #[tokio::test]
    async fn test_remote_storage_filter_requires_pool_tier() {
        let catalog = MemoryCatalog::with_entities([
            CatalogEntity::RemoteStorage(RemoteStorage {
                id: "san1".into(),
                name: "san1".into(),
                site_id: "s1".into(),
                vendor: "acme".into(),
                enabled: true,
            }),
            CatalogEntity::RemoteStorage(RemoteStorage {
                id: "san2".into(),
                name: "san2".into(),
                site_id: "s1".into(),
                vendor: "acme".into(),
                enabled: true,
            }),
            CatalogEntity::Pool(Pool {
                id: "p1".into(),
                name: "p1".into(),
                storage_id: "san1".into(),
                level: StorageLevel::High,
                free_mib: 1 << 20,
                enabled: true,
            }),
        ]);
        let spec = StorageSpec {
            kind: StorageType::Remote,
            level: StorageLevel::High,
            size_mib: 100,
        };

        let storages =
            filter_remote_storages(&catalog, &catalog, &Condition::default(), Some(&spec))
                .await
                .unwrap();
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].id, "san1");

        assert!(
            filter_remote_storages(&catalog, &catalog, &Condition::ha(), Some(&spec))
                .await
                .is_err()
        );
    }
}
