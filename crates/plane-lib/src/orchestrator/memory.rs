//! Simulated orchestrator
//!
//! Keeps unit, job and volume state in memory. Units become ready as soon
//! as they are created unless their host is held, which makes the type
//! useful for dry runs of the engine and for exercising failure paths.

use super::{
    ClaimSpec, ExecOutput, JobKey, JobPhase, JobPod, JobSpec, JobStatus, Orchestrator, UnitPhase,
    UnitSpec, UnitStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory orchestrator
pub struct MemoryOrchestrator {
    namespace: String,
    units: DashMap<String, (UnitSpec, UnitStatus)>,
    held_hosts: DashSet<String>,
    unschedulable: DashMap<String, bool>,
    config_maps: DashMap<String, BTreeMap<String, String>>,
    claims: DashMap<String, String>,
    volumes: DashSet<String>,
    jobs: DashMap<JobKey, (JobSpec, JobPhase)>,
    pods: DashMap<JobKey, JobPod>,
    logs: DashMap<JobKey, String>,
    exec_log: Mutex<Vec<(String, Vec<String>)>>,
    next_ip: AtomicU32,
    refuse_jobs: AtomicBool,
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryOrchestrator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            units: DashMap::new(),
            held_hosts: DashSet::new(),
            unschedulable: DashMap::new(),
            config_maps: DashMap::new(),
            claims: DashMap::new(),
            volumes: DashSet::new(),
            jobs: DashMap::new(),
            pods: DashMap::new(),
            logs: DashMap::new(),
            exec_log: Mutex::new(Vec::new()),
            next_ip: AtomicU32::new(1),
            refuse_jobs: AtomicBool::new(false),
        }
    }

    /// Units created on this host stay pending and never become ready
    pub fn hold_host(&self, host: &str) {
        self.held_hosts.insert(host.to_string());
    }

    pub fn release_host(&self, host: &str) {
        self.held_hosts.remove(host);
        for mut entry in self.units.iter_mut() {
            let (spec, status) = entry.value_mut();
            if spec.host == host && status.phase == UnitPhase::Pending {
                status.phase = UnitPhase::Running;
                status.ready = true;
                status.ip = Some(self.allocate_ip());
            }
        }
    }

    /// Make job creation fail until turned off again
    pub fn refuse_jobs(&self, refuse: bool) {
        self.refuse_jobs.store(refuse, Ordering::SeqCst);
    }

    /// Mark a unit's workload as failed
    pub fn fail_unit(&self, name: &str) {
        if let Some(mut entry) = self.units.get_mut(name) {
            entry.1.phase = UnitPhase::Failed;
            entry.1.ready = false;
        }
    }

    /// Drive a job to a phase
    pub fn set_job_phase(&self, key: &JobKey, phase: JobPhase) {
        if let Some(mut entry) = self.jobs.get_mut(key) {
            entry.1 = phase;
        }
    }

    pub fn set_pod_logs(&self, namespace: &str, pod: &str, logs: impl Into<String>) {
        self.logs.insert(JobKey::new(namespace, pod), logs.into());
    }

    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.iter().map(|u| u.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_job(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn job_names(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.iter().map(|j| j.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn has_claim(&self, name: &str) -> bool {
        self.claims.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.contains(name)
    }

    pub fn is_unschedulable(&self, host: &str) -> bool {
        self.unschedulable.get(host).map(|v| *v).unwrap_or(false)
    }

    /// Commands executed so far, as `(unit, argv)`
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.exec_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn allocate_ip(&self) -> String {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        format!("10.244.{}.{}", n / 250, n % 250 + 1)
    }

    fn initial_status(&self, spec: &UnitSpec) -> UnitStatus {
        if self.held_hosts.contains(&spec.host) {
            UnitStatus {
                name: spec.name.clone(),
                phase: UnitPhase::Pending,
                ready: false,
                ip: None,
                host: Some(spec.host.clone()),
            }
        } else {
            UnitStatus {
                name: spec.name.clone(),
                phase: UnitPhase::Running,
                ready: true,
                ip: Some(self.allocate_ip()),
                host: Some(spec.host.clone()),
            }
        }
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<()> {
        if self.units.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("unit '{}'", spec.name)));
        }
        let status = self.initial_status(spec);
        self.units.insert(spec.name.clone(), (spec.clone(), status));
        Ok(())
    }

    async fn get_unit_spec(&self, name: &str) -> Result<UnitSpec> {
        self.units
            .get(name)
            .map(|u| u.0.clone())
            .ok_or_else(|| Error::not_found("unit", name))
    }

    async fn replace_unit(&self, spec: &UnitSpec) -> Result<()> {
        let status = self.initial_status(spec);
        match self.units.get_mut(&spec.name) {
            Some(mut entry) => {
                *entry = (spec.clone(), status);
                Ok(())
            }
            None => Err(Error::not_found("unit", &spec.name)),
        }
    }

    async fn get_unit(&self, name: &str) -> Result<UnitStatus> {
        self.units
            .get(name)
            .map(|u| u.1.clone())
            .ok_or_else(|| Error::not_found("unit", name))
    }

    async fn delete_unit(&self, name: &str) -> Result<()> {
        self.units
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("unit", name))
    }

    async fn exec(&self, unit: &str, command: &[String]) -> Result<ExecOutput> {
        let status = self.get_unit(unit).await?;
        if let Ok(mut log) = self.exec_log.lock() {
            log.push((unit.to_string(), command.to_vec()));
        }
        if !status.is_ready() {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: format!("unit {unit} is not running"),
                success: false,
            });
        }
        Ok(ExecOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            success: true,
        })
    }

    async fn set_host_unschedulable(&self, host: &str, unschedulable: bool) -> Result<bool> {
        let previous = self
            .unschedulable
            .insert(host.to_string(), unschedulable)
            .unwrap_or(false);
        Ok(previous)
    }

    async fn apply_config_map(&self, name: &str, data: BTreeMap<String, String>) -> Result<()> {
        self.config_maps.insert(name.to_string(), data);
        Ok(())
    }

    async fn get_config_map(&self, name: &str) -> Result<BTreeMap<String, String>> {
        self.config_maps
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found("config map", name))
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.config_maps
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("config map", name))
    }

    async fn create_claim(&self, spec: &ClaimSpec) -> Result<()> {
        if self.claims.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("claim '{}'", spec.name)));
        }
        let volume = format!("pv-{}", spec.name);
        self.volumes.insert(volume.clone());
        self.claims.insert(spec.name.clone(), volume);
        Ok(())
    }

    async fn delete_claim(&self, _namespace: &str, name: &str) -> Result<Option<String>> {
        self.claims
            .remove(name)
            .map(|(_, volume)| Some(volume))
            .ok_or_else(|| Error::not_found("claim", name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("volume", name))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        if self.refuse_jobs.load(Ordering::SeqCst) {
            return Err(Error::orchestrator(format!("job '{}' refused", spec.key)));
        }
        if self.jobs.contains_key(&spec.key) {
            return Err(Error::Conflict(format!("job '{}'", spec.key)));
        }
        let pod = JobPod {
            name: format!("{}-pod", spec.key.name),
            claims: spec.claims.clone(),
        };
        self.pods
            .insert(JobKey::new(&spec.key.namespace, &pod.name), pod);
        self.jobs
            .insert(spec.key.clone(), (spec.clone(), JobPhase::Active));
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<JobStatus> {
        self.jobs
            .get(key)
            .map(|j| JobStatus {
                key: key.clone(),
                phase: j.1,
            })
            .ok_or_else(|| Error::not_found("job", key.to_string()))
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.jobs
            .remove(key)
            .ok_or_else(|| Error::not_found("job", key.to_string()))?;
        let pod_key = JobKey::new(&key.namespace, format!("{}-pod", key.name));
        self.pods.remove(&pod_key);
        Ok(())
    }

    async fn job_pods(&self, key: &JobKey) -> Result<Vec<JobPod>> {
        if !self.jobs.contains_key(key) {
            return Err(Error::not_found("job", key.to_string()));
        }
        let prefix = format!("{}-pod", key.name);
        Ok(self
            .pods
            .iter()
            .filter(|p| p.key().namespace == key.namespace && p.value().name == prefix)
            .map(|p| p.value().clone())
            .collect())
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        let key = JobKey::new(namespace, pod);
        if let Some(logs) = self.logs.get(&key) {
            return Ok(logs.value().clone());
        }
        if self.pods.contains_key(&key) {
            Ok(String::new())
        } else {
            Err(Error::not_found("pod", key.to_string()))
        }
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        self.pods
            .remove(&JobKey::new(namespace, pod))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("pod", format!("{namespace}/{pod}")))
    }
}

impl MemoryOrchestrator {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
