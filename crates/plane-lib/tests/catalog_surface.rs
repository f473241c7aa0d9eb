//! Catalog management through the engine

use plane_lib::catalog::{Catalog, CatalogEntity, EntityKind, HostGetter, MemoryCatalog};
use plane_lib::engine::{Engine, EngineConfig};
use plane_lib::orchestrator::Orchestrators;
use plane_lib::store::MemoryStore;
use plane_lib::{
    selector, Cluster, Error, Host, HostUsage, RemoteStorage, Selector, Site, StructuredLogger,
};
use std::sync::Arc;

fn engine() -> (Engine, Arc<MemoryCatalog>) {
    let catalog = Arc::new(MemoryCatalog::new());
    let engine = Engine::new(
        EngineConfig::default(),
        Catalog::from_shared(catalog.clone()),
        Arc::new(MemoryStore::new()),
        Orchestrators::new(),
        StructuredLogger::new("test"),
    );
    (engine, catalog)
}

fn site(id: &str) -> CatalogEntity {
    CatalogEntity::Site(Site {
        id: id.into(),
        name: format!("site-{id}"),
        domain: "k8s.local".into(),
        port: 6443,
        enabled: true,
    })
}

fn cluster(id: &str, site_id: &str) -> CatalogEntity {
    CatalogEntity::Cluster(Cluster {
        id: id.into(),
        name: id.into(),
        site_id: site_id.into(),
        images: vec![],
        enabled: true,
    })
}

fn host(id: &str, cluster_id: &str) -> Host {
    Host {
        id: id.into(),
        name: id.into(),
        ip: "10.1.0.1".into(),
        cluster_id: cluster_id.into(),
        cpu_milli: 4_000,
        memory_mib: 8_192,
        max_pods: 10,
        volumes: vec![],
        remote_storages: vec![],
        usage: HostUsage::default(),
        unschedulable: false,
        enabled: true,
    }
}

#[tokio::test]
async fn test_add_returns_completed_task() {
    let (engine, _) = engine();
    let response = engine.add_entity(site("s1")).await.unwrap();
    assert_eq!(response.object_id, "s1");
    assert_eq!(response.object_name, "site-s1");

    let task = engine.get_task(&response.task_id).await.unwrap();
    assert!(task.is_terminal());
    assert_eq!(task.action, "add_site");
}

#[tokio::test]
async fn test_duplicate_id_conflicts() {
    let (engine, _) = engine();
    engine.add_entity(site("s1")).await.unwrap();
    let err = engine.add_entity(site("s1")).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_missing_parent_is_a_validation_error() {
    let (engine, _) = engine();
    let err = engine.add_entity(cluster("c1", "nowhere")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");

    let err = engine
        .add_entity(CatalogEntity::Host(host("h1", "c1")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
}

#[tokio::test]
async fn test_delete_refuses_while_referenced() {
    let (engine, _) = engine();
    engine.add_entity(site("s1")).await.unwrap();
    engine.add_entity(cluster("c1", "s1")).await.unwrap();
    engine
        .add_entity(CatalogEntity::RemoteStorage(RemoteStorage {
            id: "rs1".into(),
            name: "san".into(),
            site_id: "s1".into(),
            vendor: "acme".into(),
            enabled: true,
        }))
        .await
        .unwrap();

    let err = engine.delete_entity(EntityKind::Site, "s1").await.unwrap_err();
    let Error::Validation(message) = err else {
        panic!("expected validation error, got {err}");
    };
    assert!(message.contains("cluster c1"), "{message}");
    assert!(message.contains("remote_storage rs1"), "{message}");

    let mut attached = host("h1", "c1");
    attached.remote_storages = vec!["rs1".into()];
    engine
        .add_entity(CatalogEntity::Host(attached))
        .await
        .unwrap();
    let err = engine
        .delete_entity(EntityKind::RemoteStorage, "rs1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("host h1"), "{err}");

    engine.delete_entity(EntityKind::Host, "h1").await.unwrap();
    engine
        .delete_entity(EntityKind::RemoteStorage, "rs1")
        .await
        .unwrap();
    engine.delete_entity(EntityKind::Cluster, "c1").await.unwrap();
    engine.delete_entity(EntityKind::Site, "s1").await.unwrap();
}

#[tokio::test]
async fn test_set_and_delete_unknown_are_not_found() {
    let (engine, _) = engine();
    assert!(engine.set_entity(site("s9")).await.unwrap_err().is_not_found());
    assert!(engine
        .delete_entity(EntityKind::Site, "s9")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_set_keeps_host_usage() {
    let (engine, catalog) = engine();
    engine.add_entity(site("s1")).await.unwrap();
    engine.add_entity(cluster("c1", "s1")).await.unwrap();
    let mut busy = host("h1", "c1");
    busy.usage.pods = 3;
    catalog.upsert(CatalogEntity::Host(busy));

    let mut edited = host("h1", "c1");
    edited.unschedulable = true;
    engine.set_entity(CatalogEntity::Host(edited)).await.unwrap();

    let stored = catalog.get_host("h1").await.unwrap();
    assert!(stored.unschedulable);
    assert_eq!(stored.usage.pods, 3);
}

#[tokio::test]
async fn test_list_filters_by_selector() {
    let (engine, _) = engine();
    engine.add_entity(site("s1")).await.unwrap();
    engine.add_entity(site("s2")).await.unwrap();
    engine.add_entity(cluster("c1", "s1")).await.unwrap();
    engine.add_entity(cluster("c2", "s2")).await.unwrap();

    let all = engine
        .list_entities(EntityKind::Cluster, &Selector::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let in_s2 = engine
        .list_entities(EntityKind::Cluster, &selector([("site_id", "s2")]))
        .await
        .unwrap();
    assert_eq!(in_s2.len(), 1);
    assert_eq!(in_s2[0].id(), "c2");
}
