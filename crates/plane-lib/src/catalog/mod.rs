//! Metadata catalog collaborators
//!
//! The scheduler only reads the catalog through these narrow getter
//! traits. `List` calls take a field-equality [`Selector`]; lookups of
//! missing ids return [`Error::NotFound`](crate::Error::NotFound).

mod memory;

pub use memory::MemoryCatalog;

use crate::models::{
    BackupEndpoint, BackupStrategy, Cluster, Host, HostBrief, Image, Network, Pool, RemoteStorage,
    Selector, Site,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait SiteGetter: Send + Sync {
    async fn get_site(&self, id: &str) -> Result<Site>;
    async fn list_sites(&self, selector: &Selector) -> Result<Vec<Site>>;
}

#[async_trait]
pub trait ClusterGetter: Send + Sync {
    async fn get_cluster(&self, id: &str) -> Result<Cluster>;
    async fn list_clusters(&self, selector: &Selector) -> Result<Vec<Cluster>>;
}

#[async_trait]
pub trait NetworkGetter: Send + Sync {
    async fn get_network(&self, id: &str) -> Result<Network>;
    async fn list_networks(&self, selector: &Selector) -> Result<Vec<Network>>;
}

#[async_trait]
pub trait HostGetter: Send + Sync {
    async fn get_host(&self, id: &str) -> Result<Host>;
    async fn list_hosts(&self, selector: &Selector) -> Result<Vec<Host>>;
    /// Current free capacity of a host
    async fn get_host_brief(&self, id: &str) -> Result<HostBrief>;
}

#[async_trait]
pub trait StorageGetter: Send + Sync {
    async fn get_storage(&self, id: &str) -> Result<RemoteStorage>;
    async fn list_storages(&self, selector: &Selector) -> Result<Vec<RemoteStorage>>;
}

#[async_trait]
pub trait PoolGetter: Send + Sync {
    async fn get_pool(&self, id: &str) -> Result<Pool>;
    async fn list_pools(&self, selector: &Selector) -> Result<Vec<Pool>>;
}

#[async_trait]
pub trait ImageGetter: Send + Sync {
    async fn get_image(&self, id: &str) -> Result<Image>;
    async fn list_images(&self, selector: &Selector) -> Result<Vec<Image>>;
}

#[async_trait]
pub trait BackupGetter: Send + Sync {
    async fn get_endpoint(&self, id: &str) -> Result<BackupEndpoint>;
    async fn list_endpoints(&self, selector: &Selector) -> Result<Vec<BackupEndpoint>>;
    async fn get_strategy(&self, id: &str) -> Result<BackupStrategy>;
    async fn list_strategies(&self, selector: &Selector) -> Result<Vec<BackupStrategy>>;
}

/// Kinds of catalog entity exposed through the management surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Site,
    Cluster,
    Host,
    Network,
    Image,
    RemoteStorage,
    Pool,
    BackupEndpoint,
    BackupStrategy,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Site => "site",
            EntityKind::Cluster => "cluster",
            EntityKind::Host => "host",
            EntityKind::Network => "network",
            EntityKind::Image => "image",
            EntityKind::RemoteStorage => "remote_storage",
            EntityKind::Pool => "pool",
            EntityKind::BackupEndpoint => "backup_endpoint",
            EntityKind::BackupStrategy => "backup_strategy",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog record of any kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEntity {
    Site(Site),
    Cluster(Cluster),
    Host(Host),
    Network(Network),
    Image(Image),
    RemoteStorage(RemoteStorage),
    Pool(Pool),
    BackupEndpoint(BackupEndpoint),
    BackupStrategy(BackupStrategy),
}

impl CatalogEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            CatalogEntity::Site(_) => EntityKind::Site,
            CatalogEntity::Cluster(_) => EntityKind::Cluster,
            CatalogEntity::Host(_) => EntityKind::Host,
            CatalogEntity::Network(_) => EntityKind::Network,
            CatalogEntity::Image(_) => EntityKind::Image,
            CatalogEntity::RemoteStorage(_) => EntityKind::RemoteStorage,
            CatalogEntity::Pool(_) => EntityKind::Pool,
            CatalogEntity::BackupEndpoint(_) => EntityKind::BackupEndpoint,
            CatalogEntity::BackupStrategy(_) => EntityKind::BackupStrategy,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CatalogEntity::Site(e) => &e.id,
            CatalogEntity::Cluster(e) => &e.id,
            CatalogEntity::Host(e) => &e.id,
            CatalogEntity::Network(e) => &e.id,
            CatalogEntity::Image(e) => &e.id,
            CatalogEntity::RemoteStorage(e) => &e.id,
            CatalogEntity::Pool(e) => &e.id,
            CatalogEntity::BackupEndpoint(e) => &e.id,
            CatalogEntity::BackupStrategy(e) => &e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogEntity::Site(e) => &e.name,
            CatalogEntity::Cluster(e) => &e.name,
            CatalogEntity::Host(e) => &e.name,
            CatalogEntity::Network(e) => &e.name,
            CatalogEntity::Image(e) => &e.id,
            CatalogEntity::RemoteStorage(e) => &e.name,
            CatalogEntity::Pool(e) => &e.name,
            CatalogEntity::BackupEndpoint(e) => &e.name,
            CatalogEntity::BackupStrategy(e) => &e.name,
        }
    }
}

/// Write half of the catalog, used by the management surface
#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Insert or replace an entity
    async fn put(&self, entity: CatalogEntity) -> Result<()>;
    /// Remove an entity; missing ids are `NotFound`
    async fn remove(&self, kind: EntityKind, id: &str) -> Result<()>;
    async fn list(&self, kind: EntityKind, selector: &Selector) -> Result<Vec<CatalogEntity>>;
}

/// Bundle of catalog handles passed to the scheduler and engine
#[derive(Clone)]
pub struct Catalog {
    pub sites: Arc<dyn SiteGetter>,
    pub clusters: Arc<dyn ClusterGetter>,
    pub networks: Arc<dyn NetworkGetter>,
    pub hosts: Arc<dyn HostGetter>,
    pub storages: Arc<dyn StorageGetter>,
    pub pools: Arc<dyn PoolGetter>,
    pub images: Arc<dyn ImageGetter>,
    pub backups: Arc<dyn BackupGetter>,
    pub writer: Arc<dyn CatalogWriter>,
}

impl Catalog {
    /// Build a bundle where a single backend serves every concern
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: SiteGetter
            + ClusterGetter
            + NetworkGetter
            + HostGetter
            + StorageGetter
            + PoolGetter
            + ImageGetter
            + BackupGetter
            + CatalogWriter
            + 'static,
    {
        Self {
            sites: backend.clone(),
            clusters: backend.clone(),
            networks: backend.clone(),
            hosts: backend.clone(),
            storages: backend.clone(),
            pools: backend.clone(),
            images: backend.clone(),
            backups: backend.clone(),
            writer: backend,
        }
    }
}
