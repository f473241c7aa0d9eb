//! Container orchestrator adapter
//!
//! The core treats the orchestrator as an async RPC boundary. Every call
//! may fail with `NotFound`, `Conflict` or a transport error; callers retry
//! from their own polling loops, implementations never retry internally.

mod memory;

pub use memory::MemoryOrchestrator;

use crate::models::{ResourceRequest, ServiceType};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Desired shape of a unit's workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub app_id: String,
    pub group: String,
    pub service_type: ServiceType,
    pub image: String,
    /// Host (node) name the unit is pinned to
    pub host: String,
    pub network: Option<String>,
    pub port: u16,
    pub resources: ResourceRequest,
    /// Volume claim to mount as the data directory
    pub claim: Option<String>,
    /// Host directory to mount as the data directory
    #[serde(default)]
    pub local_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Observed state of a unit's workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub phase: UnitPhase,
    pub ready: bool,
    pub ip: Option<String>,
    pub host: Option<String>,
}

impl UnitStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == UnitPhase::Running && self.ready
    }

    /// The workload will never become ready without being recreated
    pub fn is_dead(&self) -> bool {
        matches!(self.phase, UnitPhase::Failed | UnitPhase::Succeeded)
    }
}

/// Captured result of a command run inside a unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub key: JobKey,
    pub image: String,
    pub command: Vec<String>,
    pub host: Option<String>,
    pub claims: Vec<String>,
    /// Host directories the job reads or writes
    #[serde(default)]
    pub local_dirs: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Active,
    Complete,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Active => "active",
            JobPhase::Complete => "complete",
            JobPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobPhase::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub key: JobKey,
    pub phase: JobPhase,
}

/// A pod created by a Job, with the claims it mounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPod {
    pub name: String,
    pub claims: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSpec {
    pub name: String,
    pub storage_class: Option<String>,
    pub size_mib: u64,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<()>;
    async fn get_unit_spec(&self, name: &str) -> Result<UnitSpec>;
    /// Replace a unit's workload with a modified copy of its spec
    async fn replace_unit(&self, spec: &UnitSpec) -> Result<()>;
    async fn get_unit(&self, name: &str) -> Result<UnitStatus>;
    async fn delete_unit(&self, name: &str) -> Result<()>;
    async fn exec(&self, unit: &str, command: &[String]) -> Result<ExecOutput>;

    /// Set a host's unschedulable flag, returning the previous value
    async fn set_host_unschedulable(&self, host: &str, unschedulable: bool) -> Result<bool>;

    async fn apply_config_map(&self, name: &str, data: BTreeMap<String, String>) -> Result<()>;
    async fn get_config_map(&self, name: &str) -> Result<BTreeMap<String, String>>;
    async fn delete_config_map(&self, name: &str) -> Result<()>;

    async fn create_claim(&self, spec: &ClaimSpec) -> Result<()>;
    /// Delete a claim, returning the name of the volume it was bound to
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<Option<String>>;
    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn create_job(&self, spec: &JobSpec) -> Result<()>;
    async fn get_job(&self, key: &JobKey) -> Result<JobStatus>;
    async fn delete_job(&self, key: &JobKey) -> Result<()>;
    async fn job_pods(&self, key: &JobKey) -> Result<Vec<JobPod>>;
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String>;
    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()>;
}

/// Treat `NotFound` as success for idempotent deletes
pub fn ignore_not_found<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

/// Orchestrator adapters keyed by site id
#[derive(Clone, Default)]
pub struct Orchestrators {
    sites: Arc<DashMap<String, Arc<dyn Orchestrator>>>,
}

impl Orchestrators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, site_id: impl Into<String>, orchestrator: Arc<dyn Orchestrator>) {
        self.sites.insert(site_id.into(), orchestrator);
    }

    pub fn get(&self, site_id: &str) -> Result<Arc<dyn Orchestrator>> {
        self.sites
            .get(site_id)
            .map(|o| o.value().clone())
            .ok_or_else(|| Error::not_found("site orchestrator", site_id))
    }

    /// Registered site ids, sorted
    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.sites.iter().map(|s| s.key().clone()).collect();
        sites.sort();
        sites
    }
}
