use super::*;
use crate::catalog::{CatalogEntity, MemoryCatalog};
use crate::models::{Cluster, Condition, Host, HostUsage, Network};
use std::sync::Arc;

fn cluster(id: &str, image: &str) -> CatalogEntity {
    CatalogEntity::Cluster(Cluster {
        id: id.into(),
        name: id.into(),
        site_id: "s1".into(),
        images: vec![image.into()],
        enabled: true,
    })
}

fn host(id: &str, cluster: &str, cpu: u64, max_pods: u64) -> CatalogEntity {
    CatalogEntity::Host(Host {
        id: id.into(),
        name: id.into(),
        ip: format!("10.1.0.{}", id.trim_start_matches('h')),
        cluster_id: cluster.into(),
        cpu_milli: cpu,
        memory_mib: 8192,
        max_pods,
        volumes: vec![],
        remote_storages: vec![],
        usage: HostUsage::default(),
        unschedulable: false,
        enabled: true,
    })
}

fn network(id: &str, cluster: &str, topology: &str) -> CatalogEntity {
    CatalogEntity::Network(Network {
        id: id.into(),
        name: id.into(),
        cluster_id: cluster.into(),
        topology: vec![topology.into()],
        bandwidth_mbps: 10_000,
        enabled: true,
    })
}

fn scheduler(entities: Vec<CatalogEntity>) -> Scheduler {
    let catalog = Arc::new(MemoryCatalog::with_entities(entities));
    Scheduler::new(Catalog::from_shared(catalog), PlaneMetrics::new())
}

fn schedule_request(replicas: u32, cpu: u64, conditions: Conditions) -> ScheduleRequest {
    ScheduleRequest {
        group: "orders-mysql00".into(),
        service_type: ServiceType::Mysql,
        image: "mysql-8.0".into(),
        replicas,
        request: ResourceRequest {
            service_type: ServiceType::Mysql,
            cpu_milli: cpu,
            memory_mib: 1024,
            storage_medium_mib: 0,
            storage_high_mib: 0,
            bandwidth: None,
        },
        storage: None,
        conditions,
        exclude_hosts: vec![],
    }
}

#[tokio::test]
async fn test_ha_cluster_needs_two_compatible_clusters() {
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        cluster("c2", "mysql-5.7"),
        host("h1", "c1", 4000, 10),
        host("h2", "c2", 4000, 10),
    ]);
    let conditions = Conditions {
        cluster: Condition::ha(),
        ..Default::default()
    };

    let err = scheduler
        .search(&schedule_request(2, 1000, conditions))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_ha_cluster_passes_with_two_compatible_clusters() {
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        cluster("c2", "mysql-8.0"),
        host("h1", "c1", 4000, 10),
        host("h2", "c2", 4000, 10),
    ]);
    let conditions = Conditions {
        cluster: Condition::ha(),
        ..Default::default()
    };

    let plans = scheduler
        .search(&schedule_request(2, 1000, conditions))
        .await
        .unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].group.len(), 2);
}

#[tokio::test]
async fn test_three_group_plan_ranks_first_regardless_of_order() {
    // topology "a" spans two clusters, "z" spans three
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        cluster("c2", "mysql-8.0"),
        cluster("c3", "mysql-8.0"),
        host("h1", "c1", 4000, 10),
        host("h2", "c2", 4000, 10),
        host("h3", "c3", 4000, 10),
        network("n1", "c1", "a"),
        network("n2", "c2", "a"),
        network("n3", "c1", "z"),
        network("n4", "c2", "z"),
        network("n5", "c3", "z"),
    ]);
    let mut req = schedule_request(1, 1000, Conditions::default());
    req.request.bandwidth = Some(100);

    let plans = scheduler.search(&req).await.unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].topology, "z");
    assert_eq!(plans[0].group.len(), 3);
}

#[tokio::test]
async fn test_schedule_assigns_slots_with_cluster_and_site() {
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        host("h1", "c1", 4000, 10),
        host("h2", "c1", 2000, 10),
    ]);

    let placement = scheduler
        .schedule(&schedule_request(2, 1500, Conditions::default()))
        .await
        .unwrap();
    assert_eq!(placement.slots.len(), 2);
    for slot in &placement.slots {
        assert_eq!(slot.cluster_id, "c1");
        assert_eq!(slot.site_id, "s1");
    }
}

#[tokio::test]
async fn test_schedule_rejects_when_no_pod_slot() {
    let scheduler = scheduler(vec![cluster("c1", "mysql-8.0"), host("h1", "c1", 4000, 0)]);

    let err = scheduler
        .schedule(&schedule_request(1, 1000, Conditions::default()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientResource(AdmissionError::Unsatisfied { .. })
    ));
}

#[tokio::test]
async fn test_excluded_hosts_are_not_used() {
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        host("h1", "c1", 8000, 10),
        host("h2", "c1", 2000, 10),
    ]);
    let mut req = schedule_request(1, 1000, Conditions::default());
    req.exclude_hosts = vec!["h1".into()];

    let placement = scheduler.schedule(&req).await.unwrap();
    assert_eq!(placement.slots[0].host.id, "h2");
}

#[tokio::test]
async fn test_host_ha_spreads_replicas() {
    let scheduler = scheduler(vec![
        cluster("c1", "mysql-8.0"),
        host("h1", "c1", 8000, 10),
        host("h2", "c1", 8000, 10),
        host("h3", "c1", 8000, 10),
    ]);
    let conditions = Conditions {
        host: Condition::ha(),
        ..Default::default()
    };

    let placement = scheduler
        .schedule(&schedule_request(3, 1000, conditions))
        .await
        .unwrap();
    let mut hosts: Vec<_> = placement.slots.iter().map(|s| s.host.id.clone()).collect();
    hosts.sort();
    hosts.dedup();
    assert_eq!(hosts.len(), 3);
}
