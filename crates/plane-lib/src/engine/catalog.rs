//! Catalog management surface

use super::{host_lock_key, Engine};
use crate::catalog::{CatalogEntity, EntityKind};
use crate::models::{selector, Selector, TaskObjectResponse};
use crate::{Error, Result};

impl Engine {
    /// Add a catalog entity after checking its parent exists
    pub async fn add_entity(&self, entity: CatalogEntity) -> Result<TaskObjectResponse> {
        let kind = entity.kind();
        if entity.id().is_empty() {
            return Err(Error::validation(format!("{kind} id is required")));
        }
        if self.entity_exists(kind, entity.id()).await? {
            return Err(Error::Conflict(format!("{kind} '{}'", entity.id())));
        }
        self.check_parent(&entity).await?;

        let (id, name) = (entity.id().to_string(), entity.name().to_string());
        self.catalog.writer.put(entity).await?;
        self.completed_task(&format!("add_{kind}"), &id, &name).await
    }

    /// Replace an existing catalog entity
    ///
    /// Host usage is owned by the engine and survives the update.
    pub async fn set_entity(&self, mut entity: CatalogEntity) -> Result<TaskObjectResponse> {
        let kind = entity.kind();
        if !self.entity_exists(kind, entity.id()).await? {
            return Err(Error::not_found(kind.as_str(), entity.id()));
        }
        self.check_parent(&entity).await?;

        // Usage is read and written back under the lock the engine charges with
        let _usage = match &entity {
            CatalogEntity::Host(host) => Some(self.locks.lock(&host_lock_key(&host.id)).await),
            _ => None,
        };
        if let CatalogEntity::Host(host) = &mut entity {
            host.usage = self.catalog.hosts.get_host(&host.id).await?.usage;
        }

        let (id, name) = (entity.id().to_string(), entity.name().to_string());
        self.catalog.writer.put(entity).await?;
        self.completed_task(&format!("set_{kind}"), &id, &name).await
    }

    /// Remove a catalog entity nothing depends on any more
    pub async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<TaskObjectResponse> {
        if !self.entity_exists(kind, id).await? {
            return Err(Error::not_found(kind.as_str(), id));
        }
        let dependents = self.dependents(kind, id).await?;
        if !dependents.is_empty() {
            return Err(Error::validation(format!(
                "{kind} {id} is still referenced by {}",
                dependents.join(", ")
            )));
        }

        self.catalog.writer.remove(kind, id).await?;
        self.completed_task(&format!("delete_{kind}"), id, id).await
    }

    pub async fn list_entities(&self, kind: EntityKind, selector: &Selector) -> Result<Vec<CatalogEntity>> {
        self.catalog.writer.list(kind, selector).await
    }

    async fn entity_exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let found = self.catalog.writer.list(kind, &selector([("id", id)])).await?;
        Ok(!found.is_empty())
    }

    async fn check_parent(&self, entity: &CatalogEntity) -> Result<()> {
        let parent = match entity {
            CatalogEntity::Cluster(c) => self.catalog.sites.get_site(&c.site_id).await.map(|_| ()),
            CatalogEntity::Host(h) => self.catalog.clusters.get_cluster(&h.cluster_id).await.map(|_| ()),
            CatalogEntity::Network(n) => self.catalog.clusters.get_cluster(&n.cluster_id).await.map(|_| ()),
            CatalogEntity::RemoteStorage(s) => self.catalog.sites.get_site(&s.site_id).await.map(|_| ()),
            CatalogEntity::Pool(p) => self.catalog.storages.get_storage(&p.storage_id).await.map(|_| ()),
            CatalogEntity::BackupStrategy(s) => {
                match self.catalog.backups.get_endpoint(&s.endpoint_id).await {
                    Ok(_) => self.store.get_app(&s.app_id).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            CatalogEntity::Site(_) | CatalogEntity::Image(_) | CatalogEntity::BackupEndpoint(_) => Ok(()),
        };
        match parent {
            Err(e) if e.is_not_found() => Err(Error::validation(format!(
                "{} {}: {e}",
                entity.kind(),
                entity.id()
            ))),
            other => other,
        }
    }

    /// Entities that reference `kind/id`, as `"<kind> <id>"`
    async fn dependents(&self, kind: EntityKind, id: &str) -> Result<Vec<String>> {
        let children: &[(EntityKind, &str)] = match kind {
            EntityKind::Site => &[(EntityKind::Cluster, "site_id"), (EntityKind::RemoteStorage, "site_id")],
            EntityKind::Cluster => &[(EntityKind::Host, "cluster_id"), (EntityKind::Network, "cluster_id")],
            EntityKind::RemoteStorage => &[(EntityKind::Pool, "storage_id")],
            EntityKind::BackupEndpoint => &[(EntityKind::BackupStrategy, "endpoint_id")],
            EntityKind::Host | EntityKind::Network | EntityKind::Image | EntityKind::Pool | EntityKind::BackupStrategy => &[],
        };

        let mut dependents = Vec::new();
        for (child, field) in children {
            let found = self.catalog.writer.list(*child, &selector([(*field, id)])).await?;
            dependents.extend(found.iter().map(|e| format!("{child} {}", e.id())));
        }

        match kind {
            EntityKind::Host => {
                let units = self.store.list_units(&selector([("host_id", id)])).await?;
                dependents.extend(units.iter().map(|u| format!("unit {}", u.name)));
            }
            EntityKind::RemoteStorage => {
                let hosts = self.catalog.hosts.list_hosts(&Selector::new()).await?;
                dependents.extend(
                    hosts
                        .iter()
                        .filter(|h| h.remote_storages.iter().any(|s| s == id))
                        .map(|h| format!("host {}", h.id)),
                );
            }
            _ => {}
        }
        Ok(dependents)
    }
}
