//! Request validation and group expansion

use crate::catalog::ImageGetter;
use crate::models::{
    group_name, AppSpec, Conditions, ResourceRequest, ServiceSpec, ServiceType, StorageSpec,
};
use crate::scheduler::ScheduleRequest;
use crate::{Error, Result};

/// Minimum replicas for the HA coordinator to hold a quorum
pub const CMHA_MIN_REPLICAS: u32 = 3;

/// One replica-set to deploy
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRequest {
    pub name: String,
    pub service_type: ServiceType,
    pub image: String,
    pub replicas: u32,
    pub request: ResourceRequest,
    pub storage: Option<StorageSpec>,
    pub conditions: Conditions,
}

impl GroupRequest {
    /// Scheduling request for `replicas` more units, avoiding `exclude_hosts`
    pub fn schedule_request(&self, replicas: u32, exclude_hosts: Vec<String>) -> ScheduleRequest {
        ScheduleRequest {
            group: self.name.clone(),
            service_type: self.service_type,
            image: self.image.clone(),
            replicas,
            request: self.request.clone(),
            storage: self.storage.clone(),
            conditions: self.conditions.clone(),
            exclude_hosts,
        }
    }
}

/// Expand an application request into its groups, in deployment order
pub fn group_requests(spec: &AppSpec) -> Vec<GroupRequest> {
    spec.services()
        .into_iter()
        .flat_map(|(service_type, service)| {
            (0..service.groups).map(move |ordinal| GroupRequest {
                name: group_name(&spec.name, service_type, ordinal),
                service_type,
                image: service.image.clone(),
                replicas: service.replicas,
                request: service.resource_request(service_type),
                storage: service.storage.clone(),
                conditions: service.conditions.clone(),
            })
        })
        .collect()
}

/// Validate an application request against the image catalog
pub async fn validate_app(images: &dyn ImageGetter, spec: &AppSpec) -> Result<Vec<GroupRequest>> {
    validate_name(&spec.name)?;
    if spec.arch.is_empty() {
        return Err(Error::validation("arch is required"));
    }
    if spec.database.groups == 0 {
        return Err(Error::validation("at least one database group is required"));
    }
    if spec.cmha.is_some() != spec.proxy.is_some() {
        return Err(Error::validation("proxy and cmha must be used together"));
    }
    if let Some(cmha) = &spec.cmha {
        if cmha.replicas < CMHA_MIN_REPLICAS {
            return Err(Error::validation(format!(
                "cmha requires at least {CMHA_MIN_REPLICAS} replicas, got {}",
                cmha.replicas
            )));
        }
    }

    for (service_type, service) in spec.services() {
        validate_service(service_type, service)?;

        let image = match images.get_image(&service.image).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("image {} not found", service.image)))
            }
            Err(e) => return Err(e),
        };
        if image.service_type != service_type {
            return Err(Error::validation(format!(
                "image {} is a {} image, not {}",
                image.id, image.service_type, service_type
            )));
        }
        if image.arch != spec.arch {
            return Err(Error::validation(format!(
                "image {} is built for {}, application requires {}",
                image.id, image.arch, spec.arch
            )));
        }
        if !image.enabled {
            return Err(Error::validation(format!("image {} is disabled", image.id)));
        }
    }

    Ok(group_requests(spec))
}

fn validate_service(service_type: ServiceType, service: &ServiceSpec) -> Result<()> {
    if service.groups == 0 || service.replicas == 0 {
        return Err(Error::validation(format!(
            "{service_type}: groups and replicas must be positive"
        )));
    }
    if service.cpu_milli == 0 || service.memory_mib == 0 {
        return Err(Error::validation(format!(
            "{service_type}: cpu and memory must be positive"
        )));
    }
    if let Some(storage) = &service.storage {
        if storage.size_mib == 0 {
            return Err(Error::validation(format!(
                "{service_type}: storage size must be positive"
            )));
        }
    }
    Ok(())
}

/// Names end up in orchestrator object names, so keep them DNS-safe
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 40
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid application name '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntity, MemoryCatalog};
    use crate::models::Image;

    fn image(id: &str, service_type: ServiceType, arch: &str) -> CatalogEntity {
        CatalogEntity::Image(Image {
            id: id.into(),
            service_type,
            version: "1".into(),
            arch: arch.into(),
            enabled: true,
        })
    }

    fn service(image: &str, replicas: u32) -> ServiceSpec {
        ServiceSpec {
            image: image.into(),
            groups: 1,
            replicas,
            cpu_milli: 1000,
            memory_mib: 1024,
            storage: None,
            bandwidth: None,
            conditions: Conditions::default(),
        }
    }

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::with_entities([
            image("mysql-8.0", ServiceType::Mysql, "amd64"),
            image("mysql-8.0-arm", ServiceType::Mysql, "arm64"),
            image("cmha-1.0", ServiceType::Cmha, "amd64"),
            image("proxysql-2.5", ServiceType::Proxysql, "amd64"),
        ])
    }

    fn app(database: ServiceSpec) -> AppSpec {
        AppSpec {
            name: "orders".into(),
            arch: "amd64".into(),
            database,
            cmha: None,
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_valid_request_expands_groups() {
        let mut spec = app(service("mysql-8.0", 2));
        spec.database.groups = 2;
        spec.cmha = Some(service("cmha-1.0", 3));
        spec.proxy = Some(service("proxysql-2.5", 2));

        let groups = validate_app(&catalog(), &spec).await.unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["orders-mysql00", "orders-mysql01", "orders-cmha00", "orders-proxysql00"]
        );
    }

    #[tokio::test]
    async fn test_proxy_without_cmha_is_rejected() {
        let mut spec = app(service("mysql-8.0", 1));
        spec.proxy = Some(service("proxysql-2.5", 2));

        let err = validate_app(&catalog(), &spec).await.unwrap_err();
        assert!(err.to_string().contains("used together"));
    }

    #[tokio::test]
    async fn test_cmha_needs_three_replicas() {
        let mut spec = app(service("mysql-8.0", 1));
        spec.cmha = Some(service("cmha-1.0", 2));
        spec.proxy = Some(service("proxysql-2.5", 1));

        let err = validate_app(&catalog(), &spec).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_image_arch_and_type_must_match() {
        let spec = app(service("mysql-8.0-arm", 1));
        assert!(validate_app(&catalog(), &spec).await.is_err());

        let spec = app(service("cmha-1.0", 1));
        assert!(validate_app(&catalog(), &spec).await.is_err());

        let spec = app(service("mysql-9.9", 1));
        let err = validate_app(&catalog(), &spec).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_name_must_be_dns_safe() {
        let mut spec = app(service("mysql-8.0", 1));
        spec.name = "Orders_DB".into();
        assert!(validate_app(&catalog(), &spec).await.is_err());
    }
}
