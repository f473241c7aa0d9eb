//! Orchestration engine
//!
//! Every mutating operation validates and admits synchronously, records a
//! [`Task`], and hands the long-running part to a wait task keyed by the
//! application id. Callers poll the task for the terminal outcome.

mod backup;
mod catalog;
mod delete;
mod deploy;
mod fanin;
mod locks;
mod resize;
mod unit;
mod validate;

pub use backup::StoreBackupCallback;
pub use fanin::FanIn;
pub use locks::KeyedLocks;
pub use validate::{group_requests, validate_app, GroupRequest, CMHA_MIN_REPLICAS};

use crate::catalog::Catalog;
use crate::models::{
    Application, ResourceRequest, Selector, Task, TaskObjectResponse, TaskStatus, Unit,
};
use crate::observability::{PlaneMetrics, StructuredLogger};
use crate::orchestrator::{ClaimSpec, Orchestrator, Orchestrators, UnitSpec, UnitStatus};
use crate::scheduler::{admit, Scheduler};
use crate::store::Store;
use crate::wait::WaitTasks;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lock key shared by every step that turns free capacity into usage
const PLACEMENT_LOCK: &str = "placement";

/// Engine timing and placement knobs, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between polls of orchestrator state
    pub poll_interval_ms: u64,
    /// Readiness budget; a whole deployment is bounded by three times this
    pub ready_timeout_ms: u64,
    /// Window a freshly created unit gets to become ready
    pub unit_wait_timeout_ms: u64,
    pub delete_timeout_ms: u64,
    pub resize_timeout_ms: u64,
    /// Pause between attempts of bounded-retry flows
    pub retry_interval_ms: u64,
    pub retry_times: u32,
    /// Upper bound for backup and restore jobs
    pub job_timeout_ms: u64,
    /// Namespace for units, claims, config maps and jobs
    pub namespace: String,
    pub backup_image: String,
    /// Control binary inside every unit image
    pub unit_ctl: String,
    /// Host directory holding host-storage unit data, one level per tier
    pub local_data_root: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            ready_timeout_ms: 300_000,
            unit_wait_timeout_ms: 180_000,
            delete_timeout_ms: 120_000,
            resize_timeout_ms: 300_000,
            retry_interval_ms: 5_000,
            retry_times: 10,
            job_timeout_ms: 3_600_000,
            namespace: "default".to_string(),
            backup_image: "dbplane/backup:latest".to_string(),
            unit_ctl: "/opt/dbplane/bin/unitctl".to_string(),
            local_data_root: "/var/lib/dbplane".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn unit_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_wait_timeout_ms)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_timeout_ms)
    }

    pub fn resize_timeout(&self) -> Duration {
        Duration::from_millis(self.resize_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Upper bound for a single-unit retry flow
    fn retry_budget(&self) -> Duration {
        (self.retry_interval() + self.unit_wait_timeout() * 2) * (self.retry_times.max(1) + 1)
    }
}

/// Receives deployed units so they can be monitored
#[async_trait]
pub trait MonitorRegistrar: Send + Sync {
    async fn register(&self, unit: &Unit) -> Result<()>;
    async fn deregister(&self, unit: &Unit) -> Result<()>;
}

/// Registrar used when no monitoring backend is configured
pub struct NoopMonitor;

#[async_trait]
impl MonitorRegistrar for NoopMonitor {
    async fn register(&self, _unit: &Unit) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self, _unit: &Unit) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    catalog: Catalog,
    store: Arc<dyn Store>,
    orchestrators: Orchestrators,
    scheduler: Scheduler,
    tasks: WaitTasks,
    locks: KeyedLocks,
    monitor: Arc<dyn MonitorRegistrar>,
    metrics: PlaneMetrics,
    logger: StructuredLogger,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: Catalog,
        store: Arc<dyn Store>,
        orchestrators: Orchestrators,
        logger: StructuredLogger,
    ) -> Self {
        let metrics = PlaneMetrics::new();
        Self {
            config: Arc::new(config),
            scheduler: Scheduler::new(catalog.clone(), metrics.clone()),
            catalog,
            store,
            orchestrators,
            tasks: WaitTasks::new(metrics.clone()),
            locks: KeyedLocks::new(),
            monitor: Arc::new(NoopMonitor),
            metrics,
            logger,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorRegistrar>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn wait_tasks(&self) -> &WaitTasks {
        &self.tasks
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.store.get_task(id).await
    }

    pub async fn get_app(&self, id: &str) -> Result<Application> {
        self.store.get_app(id).await
    }

    pub async fn list_apps(&self, selector: &Selector) -> Result<Vec<Application>> {
        self.store.list_apps(selector).await
    }

    pub async fn list_units(&self, selector: &Selector) -> Result<Vec<Unit>> {
        self.store.list_units(selector).await
    }

    fn orchestrator(&self, site_id: &str) -> Result<Arc<dyn Orchestrator>> {
        self.orchestrators.get(site_id)
    }

    /// Record a running task
    async fn start_task(&self, action: &str, related_id: &str) -> Result<Task> {
        let task = Task::running(action, related_id);
        self.store.insert_task(&task).await?;
        self.logger.log_task_started(&task.id, action, related_id);
        Ok(task)
    }

    /// Write a task's terminal state
    async fn finish_task(&self, mut task: Task, started: Instant, result: &Result<()>) {
        task.finished_at = Some(chrono::Utc::now());
        let outcome = match result {
            Ok(()) => {
                task.status = TaskStatus::Success;
                task.error = None;
                "success"
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                e.kind()
            }
        };

        if let Err(e) = self.store.update_task(&task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task outcome");
        }
        self.metrics
            .observe_task(&task.action, outcome, started.elapsed().as_secs_f64());
        self.logger
            .log_task_finished(&task.id, &task.action, task.error.as_deref());
    }

    /// Record an operation that completed synchronously
    async fn completed_task(&self, action: &str, object_id: &str, object_name: &str) -> Result<TaskObjectResponse> {
        let mut task = Task::running(action, object_id);
        task.status = TaskStatus::Success;
        task.finished_at = Some(chrono::Utc::now());
        self.store.insert_task(&task).await?;
        self.logger.log_task_finished(&task.id, action, None);
        Ok(TaskObjectResponse {
            object_id: object_id.to_string(),
            object_name: object_name.to_string(),
            task_id: task.id,
        })
    }

    fn unit_spec(&self, unit: &Unit) -> UnitSpec {
        let mut env = BTreeMap::new();
        env.insert("DBPLANE_APP_ID".to_string(), unit.app_id.clone());
        env.insert("DBPLANE_GROUP".to_string(), unit.group.clone());
        env.insert("DBPLANE_UNIT".to_string(), unit.name.clone());
        env.insert("DBPLANE_SERVICE".to_string(), unit.service_type.to_string());
        UnitSpec {
            name: unit.name.clone(),
            app_id: unit.app_id.clone(),
            group: unit.group.clone(),
            service_type: unit.service_type,
            image: unit.image.clone(),
            host: unit.host_name.clone(),
            network: unit.network_id.clone(),
            port: unit.port,
            resources: unit.resources.clone(),
            claim: unit.claim_name(),
            local_dir: unit.local_data_dir(&self.config.local_data_root),
            env,
        }
    }

    /// `unit_ctl` followed by `args`
    fn ctl(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.config.unit_ctl.as_str())
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    /// Run a control command in a unit, failing on a non-zero exit
    async fn exec_ctl(&self, orch: &dyn Orchestrator, unit: &str, args: &[&str]) -> Result<()> {
        let output = orch.exec(unit, &self.ctl(args)).await?;
        if output.success {
            Ok(())
        } else {
            Err(Error::orchestrator(format!(
                "{} in {unit} failed: {}",
                args.first().copied().unwrap_or_default(),
                output.stderr.trim()
            )))
        }
    }

    /// Move a unit's footprint between hosts in the catalog's usage ledger
    async fn adjust_host_usage(
        &self,
        host_id: &str,
        release: Option<&ResourceRequest>,
        charge: Option<&ResourceRequest>,
    ) -> Result<()> {
        let _guard = self.locks.lock(&host_lock_key(host_id)).await;
        let mut host = self.catalog.hosts.get_host(host_id).await?;
        let usage = &mut host.usage;
        if let Some(r) = release {
            usage.cpu_milli = usage.cpu_milli.saturating_sub(r.cpu_milli);
            usage.memory_mib = usage.memory_mib.saturating_sub(r.memory_mib);
            usage.storage_medium_mib = usage.storage_medium_mib.saturating_sub(r.storage_medium_mib);
            usage.storage_high_mib = usage.storage_high_mib.saturating_sub(r.storage_high_mib);
            usage.pods = usage.pods.saturating_sub(1);
        }
        if let Some(r) = charge {
            usage.cpu_milli += r.cpu_milli;
            usage.memory_mib += r.memory_mib;
            usage.storage_medium_mib += r.storage_medium_mib;
            usage.storage_high_mib += r.storage_high_mib;
            usage.pods += 1;
        }
        self.catalog
            .writer
            .put(crate::catalog::CatalogEntity::Host(host))
            .await
    }

    /// Best-effort usage bookkeeping
    async fn track_usage(&self, host_id: &str, release: Option<&ResourceRequest>, charge: Option<&ResourceRequest>) {
        if let Err(e) = self.adjust_host_usage(host_id, release, charge).await {
            warn!(host = %host_id, error = %e, "Failed to update host usage");
        }
    }

    /// Poll until a unit is running and ready
    async fn wait_unit_ready(
        &self,
        orch: &dyn Orchestrator,
        name: &str,
        window: Duration,
        token: &CancellationToken,
    ) -> Result<UnitStatus> {
        let deadline = Instant::now() + window;
        loop {
            let status = orch.get_unit(name).await?;
            if status.is_ready() {
                return Ok(status);
            }
            if status.is_dead() {
                return Err(Error::orchestrator(format!("unit {name} terminated ({:?})", status.phase)));
            }
            self.pause(deadline, token, window, name).await?;
        }
    }

    /// Poll until a unit no longer exists
    async fn wait_unit_gone(
        &self,
        orch: &dyn Orchestrator,
        name: &str,
        window: Duration,
        token: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + window;
        loop {
            match orch.get_unit(name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) => self.pause(deadline, token, window, name).await?,
            }
        }
    }

    /// Sleep one poll interval, failing on deadline or cancellation
    async fn pause(&self, deadline: Instant, token: &CancellationToken, window: Duration, what: &str) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                after: window,
                what: what.to_string(),
            });
        }
        let next = (Instant::now() + self.config.poll_interval()).min(deadline);
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!("{what} cancelled"))),
            _ = tokio::time::sleep_until(next) => Ok(()),
        }
    }

    /// Serialize work on one application, giving up on cancellation
    async fn lock_app(&self, app_id: &str, token: &CancellationToken) -> Result<OwnedMutexGuard<()>> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!("waiting for application {app_id}"))),
            guard = self.locks.lock(app_id) => Ok(guard),
        }
    }

    /// Check a host can take `request` and charge it, as one step
    ///
    /// Runs under the placement lock so it cannot interleave with another
    /// placement reading the same free capacity.
    async fn reserve_host(&self, host_id: &str, request: &ResourceRequest) -> Result<()> {
        let _placing = self.locks.lock(PLACEMENT_LOCK).await;
        let host = self.catalog.hosts.get_host_brief(host_id).await?;
        if let Err(e) = admit(std::slice::from_ref(request), &[host]) {
            self.metrics.inc_admission_rejections();
            return Err(e.into());
        }
        self.adjust_host_usage(host_id, None, Some(request)).await
    }

    async fn sleep_or_cancel(&self, duration: Duration, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled("retry cancelled".to_string())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Lock key guarding a host's usage ledger
fn host_lock_key(host_id: &str) -> String {
    format!("host:{host_id}")
}

/// Volume claim for a remote-storage unit
fn claim_spec(unit: &Unit) -> Option<ClaimSpec> {
    let name = unit.claim_name()?;
    let storage = unit.storage.as_ref()?;
    Some(ClaimSpec {
        name,
        storage_class: Some(storage.level.to_string()),
        size_mib: storage.size_mib,
    })
}
