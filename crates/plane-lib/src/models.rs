//! Core data models for the control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field-equality selector used by every `list` call
pub type Selector = BTreeMap<String, String>;

/// Build a selector from `(field, value)` pairs
pub fn selector<const N: usize>(pairs: [(&str, &str); N]) -> Selector {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Records that can be filtered with a [`Selector`]
pub trait Selectable {
    /// Value of a selectable field, `None` for unknown fields
    fn field(&self, key: &str) -> Option<String>;

    fn matches(&self, selector: &Selector) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.field(k).as_deref() == Some(v.as_str()))
    }
}

/// Database service kinds managed by the plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Mysql,
    Cmha,
    Proxysql,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Mysql => "mysql",
            ServiceType::Cmha => "cmha",
            ServiceType::Proxysql => "proxysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ServiceType::Mysql => 3306,
            ServiceType::Cmha => 8500,
            ServiceType::Proxysql => 6033,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a unit's data volume lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Host,
    Remote,
}

/// Storage performance tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLevel {
    Medium,
    High,
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLevel::Medium => write!(f, "medium"),
            StorageLevel::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub port: u16,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub site_id: String,
    /// Image ids this cluster accepts
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Cluster {
    pub fn accepts(&self, image: &str) -> bool {
        self.images.iter().any(|i| i == image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub name: String,
    pub level: StorageLevel,
    pub capacity_mib: u64,
}

/// Resources already committed on a host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub pods: u64,
    pub storage_medium_mib: u64,
    pub storage_high_mib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub cluster_id: String,
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub max_pods: u64,
    #[serde(default)]
    pub volumes: Vec<LocalVolume>,
    /// Remote storage ids this host is attached to
    #[serde(default)]
    pub remote_storages: Vec<String>,
    #[serde(default)]
    pub usage: HostUsage,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Host {
    fn capacity(&self, level: StorageLevel) -> u64 {
        self.volumes
            .iter()
            .filter(|v| v.level == level)
            .map(|v| v.capacity_mib)
            .sum()
    }

    /// Free capacity snapshot
    pub fn brief(&self) -> HostBrief {
        let mut levels: Vec<StorageLevel> = self.volumes.iter().map(|v| v.level).collect();
        levels.sort();
        levels.dedup();

        HostBrief {
            id: self.id.clone(),
            name: self.name.clone(),
            ip: self.ip.clone(),
            cluster_id: self.cluster_id.clone(),
            cpu_free: self.cpu_milli.saturating_sub(self.usage.cpu_milli),
            memory_free: self.memory_mib.saturating_sub(self.usage.memory_mib),
            medium_free: self
                .capacity(StorageLevel::Medium)
                .saturating_sub(self.usage.storage_medium_mib),
            high_free: self
                .capacity(StorageLevel::High)
                .saturating_sub(self.usage.storage_high_mib),
            pod_free: self.max_pods.saturating_sub(self.usage.pods),
            levels,
            remote_storages: self.remote_storages.clone(),
            unschedulable: self.unschedulable,
        }
    }
}

/// Free-capacity view of a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBrief {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub cluster_id: String,
    pub cpu_free: u64,
    pub memory_free: u64,
    pub medium_free: u64,
    pub high_free: u64,
    pub pod_free: u64,
    pub levels: Vec<StorageLevel>,
    pub remote_storages: Vec<String>,
    pub unschedulable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    /// Topology tags; untagged networks form their own group
    #[serde(default)]
    pub topology: Vec<String>,
    #[serde(default)]
    pub bandwidth_mbps: u32,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub service_type: ServiceType,
    pub version: String,
    pub arch: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStorage {
    pub id: String,
    pub name: String,
    pub site_id: String,
    pub vendor: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub storage_id: String,
    pub level: StorageLevel,
    pub free_mib: u64,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEndpoint {
    pub id: String,
    pub name: String,
    /// e.g. `nfs`, `s3`
    pub kind: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStrategy {
    pub id: String,
    pub name: String,
    pub app_id: String,
    pub endpoint_id: String,
    /// Cron expression evaluated by the external scheduler
    pub schedule: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

macro_rules! selectable {
    ($ty:ty, |$it:ident| { $($field:literal => $value:expr),* $(,)? }) => {
        impl Selectable for $ty {
            fn field(&self, key: &str) -> Option<String> {
                let $it = self;
                match key {
                    $($field => Some($value),)*
                    _ => None,
                }
            }
        }
    };
}

selectable!(Site, |s| { "id" => s.id.clone(), "name" => s.name.clone(), "enabled" => s.enabled.to_string() });
selectable!(Cluster, |c| {
    "id" => c.id.clone(),
    "name" => c.name.clone(),
    "site_id" => c.site_id.clone(),
    "enabled" => c.enabled.to_string(),
});
selectable!(Host, |h| {
    "id" => h.id.clone(),
    "name" => h.name.clone(),
    "ip" => h.ip.clone(),
    "cluster_id" => h.cluster_id.clone(),
    "enabled" => h.enabled.to_string(),
});
selectable!(Network, |n| {
    "id" => n.id.clone(),
    "name" => n.name.clone(),
    "cluster_id" => n.cluster_id.clone(),
    "enabled" => n.enabled.to_string(),
});
selectable!(Image, |i| {
    "id" => i.id.clone(),
    "service_type" => i.service_type.to_string(),
    "version" => i.version.clone(),
    "arch" => i.arch.clone(),
    "enabled" => i.enabled.to_string(),
});
selectable!(RemoteStorage, |s| {
    "id" => s.id.clone(),
    "name" => s.name.clone(),
    "site_id" => s.site_id.clone(),
    "enabled" => s.enabled.to_string(),
});
selectable!(Pool, |p| {
    "id" => p.id.clone(),
    "name" => p.name.clone(),
    "storage_id" => p.storage_id.clone(),
    "level" => p.level.to_string(),
    "enabled" => p.enabled.to_string(),
});
selectable!(BackupEndpoint, |e| { "id" => e.id.clone(), "name" => e.name.clone(), "kind" => e.kind.clone() });
selectable!(BackupStrategy, |s| {
    "id" => s.id.clone(),
    "name" => s.name.clone(),
    "app_id" => s.app_id.clone(),
    "endpoint_id" => s.endpoint_id.clone(),
});

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Per-replica resource request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub service_type: ServiceType,
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub storage_medium_mib: u64,
    pub storage_high_mib: u64,
    pub bandwidth: Option<u32>,
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(cpu={}m mem={}Mi medium={}Mi high={}Mi)",
            self.service_type,
            self.cpu_milli,
            self.memory_mib,
            self.storage_medium_mib,
            self.storage_high_mib
        )
    }
}

/// Candidate whitelist plus HA flag for one placement dimension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub high_availability: bool,
}

impl Condition {
    pub fn ha() -> Self {
        Self {
            candidates: Vec::new(),
            high_availability: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub cluster: Condition,
    #[serde(default)]
    pub network: Condition,
    #[serde(default)]
    pub host: Condition,
    #[serde(default)]
    pub remote_storage: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub kind: StorageType,
    pub level: StorageLevel,
    pub size_mib: u64,
}

/// Shape of one service inside an application request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,
    /// Number of replica-sets, each deployed as its own group
    #[serde(default = "one")]
    pub groups: u32,
    pub replicas: u32,
    pub cpu_milli: u64,
    pub memory_mib: u64,
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    #[serde(default)]
    pub bandwidth: Option<u32>,
    #[serde(default)]
    pub conditions: Conditions,
}

fn one() -> u32 {
    1
}

impl ServiceSpec {
    /// Resource request for a single replica
    pub fn resource_request(&self, service_type: ServiceType) -> ResourceRequest {
        let (medium, high) = match &self.storage {
            Some(s) if s.kind == StorageType::Host => match s.level {
                StorageLevel::Medium => (s.size_mib, 0),
                StorageLevel::High => (0, s.size_mib),
            },
            _ => (0, 0),
        };
        ResourceRequest {
            service_type,
            cpu_milli: self.cpu_milli,
            memory_mib: self.memory_mib,
            storage_medium_mib: medium,
            storage_high_mib: high,
            bandwidth: self.bandwidth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub arch: String,
    pub database: ServiceSpec,
    #[serde(default)]
    pub cmha: Option<ServiceSpec>,
    #[serde(default)]
    pub proxy: Option<ServiceSpec>,
}

impl AppSpec {
    /// Services in deployment order
    pub fn services(&self) -> Vec<(ServiceType, &ServiceSpec)> {
        let mut services = vec![(ServiceType::Mysql, &self.database)];
        if let Some(cmha) = &self.cmha {
            services.push((ServiceType::Cmha, cmha));
        }
        if let Some(proxy) = &self.proxy {
            services.push((ServiceType::Proxysql, proxy));
        }
        services
    }

    pub fn service_mut(&mut self, service_type: ServiceType) -> Option<&mut ServiceSpec> {
        match service_type {
            ServiceType::Mysql => Some(&mut self.database),
            ServiceType::Cmha => self.cmha.as_mut(),
            ServiceType::Proxysql => self.proxy.as_mut(),
        }
    }
}

/// `"<app>-<type><NN>"`
pub fn group_name(app: &str, service_type: ServiceType, ordinal: u32) -> String {
    format!("{}-{}{:02}", app, service_type, ordinal)
}

/// `"<group>-<NN>"`
pub fn unit_name(group: &str, ordinal: u32) -> String {
    format!("{}-{:02}", group, ordinal)
}

/// Ordinal suffix of a unit name, if it has one
pub fn unit_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

// ---------------------------------------------------------------------------
// Applications, units, tasks
// ---------------------------------------------------------------------------

/// Application and per-service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Preparing,
    Orchestrating,
    Passing,
    Warning,
    Critical,
}

/// Per-group deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Preparing,
    Orch,
    Passing,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub spec: AppSpec,
    pub state: AppState,
    pub services: BTreeMap<ServiceType, AppState>,
    pub groups: BTreeMap<String, GroupState>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Application {
    pub fn new(spec: AppSpec) -> Self {
        let services = spec
            .services()
            .into_iter()
            .map(|(t, _)| (t, AppState::Preparing))
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            spec,
            state: AppState::Preparing,
            services,
            groups: BTreeMap::new(),
            task_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn uses_cmha(&self) -> bool {
        self.spec.cmha.is_some()
    }
}

selectable!(Application, |a| {
    "id" => a.id.clone(),
    "name" => a.name.clone(),
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub app_id: String,
    pub group: String,
    pub service_type: ServiceType,
    pub image: String,
    pub site_id: String,
    pub cluster_id: String,
    pub host_id: String,
    pub host_name: String,
    pub network_id: Option<String>,
    pub ip: Option<String>,
    pub port: u16,
    pub resources: ResourceRequest,
    pub storage: Option<StorageSpec>,
    pub created_at: DateTime<Utc>,
}

impl Unit {
    /// `ip:port` once the unit has an address
    pub fn endpoint(&self) -> Option<String> {
        self.ip.as_ref().map(|ip| format!("{}:{}", ip, self.port))
    }

    /// Name of the volume claim backing a remote-storage unit
    pub fn claim_name(&self) -> Option<String> {
        match &self.storage {
            Some(s) if s.kind == StorageType::Remote => Some(format!("{}-data", self.name)),
            _ => None,
        }
    }

    /// Directory under `root` holding a host-storage unit's data
    pub fn local_data_dir(&self, root: &str) -> Option<String> {
        match &self.storage {
            Some(s) if s.kind == StorageType::Host => Some(format!(
                "{}/{}/{}",
                root.trim_end_matches('/'),
                s.level,
                self.name
            )),
            _ => None,
        }
    }
}

selectable!(Unit, |u| {
    "id" => u.id.clone(),
    "name" => u.name.clone(),
    "app_id" => u.app_id.clone(),
    "group" => u.group.clone(),
    "service_type" => u.service_type.to_string(),
    "site_id" => u.site_id.clone(),
    "host_id" => u.host_id.clone(),
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
}

/// One orchestration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub action: String,
    pub related_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn running(action: impl Into<String>, related_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            related_id: related_id.into(),
            status: TaskStatus::Running,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TaskStatus::Running
    }
}

/// Returned by every mutating operation so callers can poll the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskObjectResponse {
    pub object_id: String,
    pub object_name: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFileStatus {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFile {
    pub id: String,
    /// Name of the Job producing this file
    pub job: String,
    pub namespace: String,
    pub app_id: String,
    pub unit_id: String,
    pub endpoint_id: String,
    pub status: BackupFileStatus,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

selectable!(BackupFile, |b| {
    "id" => b.id.clone(),
    "job" => b.job.clone(),
    "app_id" => b.app_id.clone(),
    "unit_id" => b.unit_id.clone(),
});
