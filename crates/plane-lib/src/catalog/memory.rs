//! In-memory catalog backend
//!
//! Serves every getter trait from concurrent maps. Used by the daemon when
//! the catalog is seeded from a file, and by tests.

use super::{
    BackupGetter, CatalogEntity, CatalogWriter, ClusterGetter, EntityKind, HostGetter,
    ImageGetter, NetworkGetter, PoolGetter, SiteGetter, StorageGetter,
};
use crate::models::{
    BackupEndpoint, BackupStrategy, Cluster, Host, HostBrief, Image, Network, Pool, RemoteStorage,
    Selectable, Selector, Site,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;

struct Table<T> {
    kind: &'static str,
    rows: DashMap<String, T>,
}

impl<T: Clone + Selectable> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            rows: DashMap::new(),
        }
    }

    fn get(&self, id: &str) -> Result<T> {
        self.rows
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found(self.kind, id))
    }

    /// Matching rows ordered by id
    fn list(&self, selector: &Selector) -> Vec<T> {
        let mut rows: Vec<(String, T)> = self
            .rows
            .iter()
            .filter(|r| r.value().matches(selector))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, v)| v).collect()
    }

    fn put(&self, id: &str, row: T) {
        self.rows.insert(id.to_string(), row);
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.rows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(self.kind, id))
    }
}

/// Concurrent in-memory catalog
pub struct MemoryCatalog {
    sites: Table<Site>,
    clusters: Table<Cluster>,
    hosts: Table<Host>,
    networks: Table<Network>,
    images: Table<Image>,
    storages: Table<RemoteStorage>,
    pools: Table<Pool>,
    endpoints: Table<BackupEndpoint>,
    strategies: Table<BackupStrategy>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            sites: Table::new("site"),
            clusters: Table::new("cluster"),
            hosts: Table::new("host"),
            networks: Table::new("network"),
            images: Table::new("image"),
            storages: Table::new("remote storage"),
            pools: Table::new("pool"),
            endpoints: Table::new("backup endpoint"),
            strategies: Table::new("backup strategy"),
        }
    }

    /// Build a catalog pre-populated with entities
    pub fn with_entities(entities: impl IntoIterator<Item = CatalogEntity>) -> Self {
        let catalog = Self::new();
        for entity in entities {
            catalog.upsert(entity);
        }
        catalog
    }

    /// Insert or replace an entity
    pub fn upsert(&self, entity: CatalogEntity) {
        match entity {
            CatalogEntity::Site(e) => self.sites.put(&e.id.clone(), e),
            CatalogEntity::Cluster(e) => self.clusters.put(&e.id.clone(), e),
            CatalogEntity::Host(e) => self.hosts.put(&e.id.clone(), e),
            CatalogEntity::Network(e) => self.networks.put(&e.id.clone(), e),
            CatalogEntity::Image(e) => self.images.put(&e.id.clone(), e),
            CatalogEntity::RemoteStorage(e) => self.storages.put(&e.id.clone(), e),
            CatalogEntity::Pool(e) => self.pools.put(&e.id.clone(), e),
            CatalogEntity::BackupEndpoint(e) => self.endpoints.put(&e.id.clone(), e),
            CatalogEntity::BackupStrategy(e) => self.strategies.put(&e.id.clone(), e),
        }
    }
}

#[async_trait]
impl SiteGetter for MemoryCatalog {
    async fn get_site(&self, id: &str) -> Result<Site> {
        self.sites.get(id)
    }

    async fn list_sites(&self, selector: &Selector) -> Result<Vec<Site>> {
        Ok(self.sites.list(selector))
    }
}

#[async_trait]
impl ClusterGetter for MemoryCatalog {
    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.clusters.get(id)
    }

    async fn list_clusters(&self, selector: &Selector) -> Result<Vec<Cluster>> {
        Ok(self.clusters.list(selector))
    }
}

#[async_trait]
impl NetworkGetter for MemoryCatalog {
    async fn get_network(&self, id: &str) -> Result<Network> {
        self.networks.get(id)
    }

    async fn list_networks(&self, selector: &Selector) -> Result<Vec<Network>> {
        Ok(self.networks.list(selector))
    }
}

#[async_trait]
impl HostGetter for MemoryCatalog {
    async fn get_host(&self, id: &str) -> Result<Host> {
        self.hosts.get(id)
    }

    async fn list_hosts(&self, selector: &Selector) -> Result<Vec<Host>> {
        Ok(self.hosts.list(selector))
    }

    async fn get_host_brief(&self, id: &str) -> Result<HostBrief> {
        self.hosts.get(id).map(|h| h.brief())
    }
}

#[async_trait]
impl StorageGetter for MemoryCatalog {
    async fn get_storage(&self, id: &str) -> Result<RemoteStorage> {
        self.storages.get(id)
    }

    async fn list_storages(&self, selector: &Selector) -> Result<Vec<RemoteStorage>> {
        Ok(self.storages.list(selector))
    }
}

#[async_trait]
impl PoolGetter for MemoryCatalog {
    async fn get_pool(&self, id: &str) -> Result<Pool> {
        self.pools.get(id)
    }

    async fn list_pools(&self, selector: &Selector) -> Result<Vec<Pool>> {
        Ok(self.pools.list(selector))
    }
}

#[async_trait]
impl ImageGetter for MemoryCatalog {
    async fn get_image(&self, id: &str) -> Result<Image> {
        self.images.get(id)
    }

    async fn list_images(&self, selector: &Selector) -> Result<Vec<Image>> {
        Ok(self.images.list(selector))
    }
}

#[async_trait]
impl BackupGetter for MemoryCatalog {
    async fn get_endpoint(&self, id: &str) -> Result<BackupEndpoint> {
        self.endpoints.get(id)
    }

    async fn list_endpoints(&self, selector: &Selector) -> Result<Vec<BackupEndpoint>> {
        Ok(self.endpoints.list(selector))
    }

    async fn get_strategy(&self, id: &str) -> Result<BackupStrategy> {
        self.strategies.get(id)
    }

    async fn list_strategies(&self, selector: &Selector) -> Result<Vec<BackupStrategy>> {
        Ok(self.strategies.list(selector))
    }
}

#[async_trait]
impl CatalogWriter for MemoryCatalog {
    async fn put(&self, entity: CatalogEntity) -> Result<()> {
        self.upsert(entity);
        Ok(())
    }

    async fn remove(&self, kind: EntityKind, id: &str) -> Result<()> {
        match kind {
            EntityKind::Site => self.sites.remove(id),
            EntityKind::Cluster => self.clusters.remove(id),
            EntityKind::Host => self.hosts.remove(id),
            EntityKind::Network => self.networks.remove(id),
            EntityKind::Image => self.images.remove(id),
            EntityKind::RemoteStorage => self.storages.remove(id),
            EntityKind::Pool => self.pools.remove(id),
            EntityKind::BackupEndpoint => self.endpoints.remove(id),
            EntityKind::BackupStrategy => self.strategies.remove(id),
        }
    }

    async fn list(&self, kind: EntityKind, selector: &Selector) -> Result<Vec<CatalogEntity>> {
        let entities = match kind {
            EntityKind::Site => wrap(self.sites.list(selector), CatalogEntity::Site),
            EntityKind::Cluster => wrap(self.clusters.list(selector), CatalogEntity::Cluster),
            EntityKind::Host => wrap(self.hosts.list(selector), CatalogEntity::Host),
            EntityKind::Network => wrap(self.networks.list(selector), CatalogEntity::Network),
            EntityKind::Image => wrap(self.images.list(selector), CatalogEntity::Image),
            EntityKind::RemoteStorage => {
                wrap(self.storages.list(selector), CatalogEntity::RemoteStorage)
            }
            EntityKind::Pool => wrap(self.pools.list(selector), CatalogEntity::Pool),
            EntityKind::BackupEndpoint => {
                wrap(self.endpoints.list(selector), CatalogEntity::BackupEndpoint)
            }
            EntityKind::BackupStrategy => {
                wrap(self.strategies.list(selector), CatalogEntity::BackupStrategy)
            }
        };
        Ok(entities)
    }
}

fn wrap<T>(rows: Vec<T>, f: fn(T) -> CatalogEntity) -> Vec<CatalogEntity> {
    rows.into_iter().map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::selector;

    fn cluster(id: &str, site: &str) -> Cluster {
        Cluster {
            id: id.into(),
            name: format!("cluster-{id}"),
            site_id: site.into(),
            images: vec!["mysql-8.0".into()],
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let catalog = MemoryCatalog::new();
        let err = catalog.get_cluster("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_by_id() {
        let catalog = MemoryCatalog::with_entities([
            CatalogEntity::Cluster(cluster("c2", "s1")),
            CatalogEntity::Cluster(cluster("c1", "s1")),
            CatalogEntity::Cluster(cluster("c3", "s2")),
        ]);

        let all = catalog.list_clusters(&Selector::new()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let site1 = catalog
            .list_clusters(&selector([("site_id", "s1")]))
            .await
            .unwrap();
        assert_eq!(site1.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_put_and_remove() {
        let catalog = MemoryCatalog::new();
        catalog
            .put(CatalogEntity::Cluster(cluster("c1", "s1")))
            .await
            .unwrap();
        assert!(catalog.get_cluster("c1").await.is_ok());

        catalog.remove(EntityKind::Cluster, "c1").await.unwrap();
        assert!(catalog.get_cluster("c1").await.unwrap_err().is_not_found());
        assert!(catalog
            .remove(EntityKind::Cluster, "c1")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
