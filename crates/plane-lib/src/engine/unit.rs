//! Single-unit flows: rebuild, migrate, backup and restore
//!
//! These run under the application's lock and use bounded retries with a
//! fixed pause between attempts.

use super::{claim_spec, Engine};
use crate::models::{
    Application, BackupFile, BackupFileStatus, Host, ServiceType, TaskObjectResponse, Unit,
};
use crate::orchestrator::{ignore_not_found, ClaimSpec, JobKey, JobPhase, JobSpec, Orchestrator, UnitStatus};
use crate::scheduler::admit;
use crate::wait::updater;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Claim size for a backup job of a unit without its own storage
const DEFAULT_BACKUP_CLAIM_MIB: u64 = 10 * 1024;

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn job_labels(kind: &str, unit: &Unit) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("dbplane/kind".to_string(), kind.to_string()),
        ("dbplane/app".to_string(), unit.app_id.clone()),
        ("dbplane/unit".to_string(), unit.name.clone()),
    ])
}

impl Engine {
    /// Recreate a unit, optionally on another host
    pub async fn rebuild_unit(&self, unit_id: &str, host_id: Option<&str>) -> Result<TaskObjectResponse> {
        let unit = self.store.get_unit(unit_id).await?;
        let app = self.store.get_app(&unit.app_id).await?;
        let target = match host_id {
            Some(host_id) => Some(self.target_host(&unit, host_id).await?),
            None => None,
        };
        self.spawn_relocate("rebuild_unit", &app, unit, target).await
    }

    /// Move a unit to a different host
    pub async fn migrate_unit(&self, unit_id: &str, host_id: &str) -> Result<TaskObjectResponse> {
        let unit = self.store.get_unit(unit_id).await?;
        if unit.host_id == host_id {
            return Err(Error::validation(format!(
                "unit {} already runs on host {host_id}",
                unit.name
            )));
        }
        let app = self.store.get_app(&unit.app_id).await?;
        let target = self.target_host(&unit, host_id).await?;
        self.spawn_relocate("migrate_unit", &app, unit, Some(target)).await
    }

    /// Check that a host can take the unit
    async fn target_host(&self, unit: &Unit, host_id: &str) -> Result<Host> {
        let host = match self.catalog.hosts.get_host(host_id).await {
            Ok(host) => host,
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("host {host_id} not found")))
            }
            Err(e) => return Err(e),
        };
        if !host.enabled || host.unschedulable {
            return Err(Error::validation(format!("host {} is not schedulable", host.name)));
        }
        let cluster = self.catalog.clusters.get_cluster(&host.cluster_id).await?;
        if cluster.site_id != unit.site_id {
            return Err(Error::validation(format!(
                "host {} is in site {}, unit {} is in site {}",
                host.name, cluster.site_id, unit.name, unit.site_id
            )));
        }

        if host.id != unit.host_id {
            if let Err(e) = admit(std::slice::from_ref(&unit.resources), &[host.brief()]) {
                self.metrics.inc_admission_rejections();
                return Err(e.into());
            }
        }
        Ok(host)
    }

    async fn spawn_relocate(
        &self,
        action: &str,
        app: &Application,
        unit: Unit,
        target: Option<Host>,
    ) -> Result<TaskObjectResponse> {
        let task = self.start_task(action, &unit.id).await?;
        let response = TaskObjectResponse {
            object_id: unit.id.clone(),
            object_name: unit.name.clone(),
            task_id: task.id.clone(),
        };

        let started = Instant::now();
        let engine = self.clone();
        let wait = self.tasks.new_wait_task(
            &app.id,
            self.config.poll_interval(),
            updater(move |result| async move {
                engine.finish_task(task, started, &result).await;
            }),
        );

        let token = wait.token();
        let engine = self.clone();
        let unit_id = unit.id;
        wait.with_timeout(self.config.retry_budget(), move || {
            let engine = engine.clone();
            let unit_id = unit_id.clone();
            let target = target.clone();
            let token = token.clone();
            async move { engine.relocate(&unit_id, target, &token).await.map(|()| true) }
        });
        Ok(response)
    }

    async fn relocate(&self, unit_id: &str, target: Option<Host>, token: &CancellationToken) -> Result<()> {
        let mut unit = self.store.get_unit(unit_id).await?;
        let _guard = self.lock_app(&unit.app_id, token).await?;
        let orch = self.orchestrator(&unit.site_id)?;

        let previous_host = unit.host_id.clone();
        if let Some(host) = target {
            unit.host_id = host.id;
            unit.host_name = host.name;
            unit.cluster_id = host.cluster_id;
        }
        let moving = previous_host != unit.host_id;
        if moving {
            self.reserve_host(&unit.host_id, &unit.resources).await?;
        }

        let (status, attempts) = match self.recreate_with_retry(orch.as_ref(), &unit, token).await {
            Ok(recreated) => recreated,
            Err(e) => {
                if moving {
                    self.track_usage(&unit.host_id, Some(&unit.resources), None).await;
                }
                return Err(e);
            }
        };

        unit.ip = status.ip;
        self.store.update_unit(&unit).await?;
        if moving {
            self.track_usage(&previous_host, Some(&unit.resources), None).await;
        }
        info!(unit = %unit.name, host = %unit.host_name, attempts, "Unit recreated");
        Ok(())
    }

    /// [`Engine::recreate_unit`] with up to `retry_times` attempts
    ///
    /// Returns the final status and the number of attempts used.
    async fn recreate_with_retry(
        &self,
        orch: &dyn Orchestrator,
        unit: &Unit,
        token: &CancellationToken,
    ) -> Result<(UnitStatus, u32)> {
        let attempts = self.config.retry_times.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.recreate_unit(orch, unit, token).await {
                Ok(status) => return Ok((status, attempt)),
                Err(e) if e.is_cancelled() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(unit = %unit.name, attempt, error = %e, "Unit recreation failed, retrying");
                    self.sleep_or_cancel(self.config.retry_interval(), token).await?;
                }
            }
        }
    }

    /// Delete, wait for it to go, create again, wait for readiness
    async fn recreate_unit(
        &self,
        orch: &dyn Orchestrator,
        unit: &Unit,
        token: &CancellationToken,
    ) -> Result<UnitStatus> {
        let window = self.config.unit_wait_timeout();
        ignore_not_found(orch.delete_unit(&unit.name).await)?;
        self.wait_unit_gone(orch, &unit.name, window, token).await?;

        if let Some(claim) = claim_spec(unit) {
            match orch.create_claim(&claim).await {
                Err(e) if e.is_conflict() => {}
                other => other?,
            }
        }
        let spec = self.unit_spec(unit);
        match orch.create_unit(&spec).await {
            Err(e) if e.is_conflict() => orch.replace_unit(&spec).await?,
            other => other?,
        }
        self.wait_unit_ready(orch, &unit.name, window, token).await
    }

    /// Start a backup job for a database unit
    ///
    /// The task succeeds once the job controller marks the backup file
    /// complete.
    pub async fn backup_unit(&self, unit_id: &str, endpoint_id: &str) -> Result<TaskObjectResponse> {
        let unit = self.store.get_unit(unit_id).await?;
        if unit.service_type != ServiceType::Mysql {
            return Err(Error::validation(format!(
                "unit {} is a {} unit, only database units can be backed up",
                unit.name, unit.service_type
            )));
        }
        let endpoint = match self.catalog.backups.get_endpoint(endpoint_id).await {
            Ok(endpoint) => endpoint,
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("backup endpoint {endpoint_id} not found")))
            }
            Err(e) => return Err(e),
        };
        let address = unit
            .endpoint()
            .ok_or_else(|| Error::validation(format!("unit {} has no address yet", unit.name)))?;

        let job = format!("backup-{}-{}", unit.name, short_id());
        let file = BackupFile {
            id: uuid::Uuid::new_v4().to_string(),
            job: job.clone(),
            namespace: self.config.namespace.clone(),
            app_id: unit.app_id.clone(),
            unit_id: unit.id.clone(),
            endpoint_id: endpoint.id.clone(),
            status: BackupFileStatus::Running,
            size: 0,
            created_at: chrono::Utc::now(),
            finished_at: None,
        };

        let orch = self.orchestrator(&unit.site_id)?;
        let claim = ClaimSpec {
            name: format!("{job}-data"),
            storage_class: None,
            size_mib: unit
                .storage
                .as_ref()
                .map(|s| s.size_mib)
                .unwrap_or(DEFAULT_BACKUP_CLAIM_MIB),
        };

        let mut labels = job_labels("backup", &unit);
        labels.insert("dbplane/backup-file".to_string(), file.id.clone());
        let spec = JobSpec {
            key: JobKey::new(&self.config.namespace, &job),
            image: self.config.backup_image.clone(),
            command: vec![
                "backup".to_string(),
                "--source".to_string(),
                address,
                "--endpoint".to_string(),
                endpoint.location.clone(),
                "--kind".to_string(),
                endpoint.kind.clone(),
            ],
            host: Some(unit.host_name.clone()),
            claims: vec![claim.name.clone()],
            local_dirs: Vec::new(),
            labels,
        };

        let task = self.start_task("backup_unit", &unit.id).await?;
        let started = Instant::now();
        if let Err(e) = self.launch_backup(orch.as_ref(), &file, &claim, &spec).await {
            self.finish_task(task, started, &Err(e.clone())).await;
            return Err(e);
        }

        let response = TaskObjectResponse {
            object_id: file.id.clone(),
            object_name: job,
            task_id: task.id.clone(),
        };

        let engine = self.clone();
        let wait = self.tasks.new_wait_task(
            &unit.app_id,
            self.config.poll_interval(),
            updater(move |result| async move {
                engine.finish_task(task, started, &result).await;
            }),
        );

        let store = self.store.clone();
        let file_id = file.id;
        wait.with_timeout(self.config.job_timeout(), move || {
            let store = store.clone();
            let file_id = file_id.clone();
            async move {
                let file = store.get_backup_file(&file_id).await?;
                match file.status {
                    BackupFileStatus::Running => Ok(false),
                    BackupFileStatus::Complete => Ok(true),
                    BackupFileStatus::Failed => Err(Error::orchestrator(format!("backup job {} failed", file.job))),
                }
            }
        });
        Ok(response)
    }

    /// Create the backup claim, file row and job, undoing what was made if a
    /// later step fails
    async fn launch_backup(
        &self,
        orch: &dyn Orchestrator,
        file: &BackupFile,
        claim: &ClaimSpec,
        spec: &JobSpec,
    ) -> Result<()> {
        orch.create_claim(claim).await?;

        if let Err(e) = self.store.insert_backup_file(file).await {
            self.drop_backup_claim(orch, &claim.name).await;
            return Err(e);
        }

        if let Err(e) = orch.create_job(spec).await {
            let mut failed = file.clone();
            failed.status = BackupFileStatus::Failed;
            failed.finished_at = Some(chrono::Utc::now());
            if let Err(persist) = self.store.update_backup_file(&failed).await {
                warn!(job = %file.job, error = %persist, "Failed to mark backup file failed");
            }
            self.drop_backup_claim(orch, &claim.name).await;
            return Err(e);
        }
        Ok(())
    }

    async fn drop_backup_claim(&self, orch: &dyn Orchestrator, claim: &str) {
        if let Err(e) = ignore_not_found(orch.delete_claim(&self.config.namespace, claim).await) {
            warn!(claim = %claim, error = %e, "Failed to delete backup claim");
        }
    }

    /// Restore a unit's data from a completed backup
    pub async fn restore_unit(&self, unit_id: &str, file_id: &str) -> Result<TaskObjectResponse> {
        let unit = self.store.get_unit(unit_id).await?;
        let file = match self.store.get_backup_file(file_id).await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("backup file {file_id} not found")))
            }
            Err(e) => return Err(e),
        };
        if file.status != BackupFileStatus::Complete {
            return Err(Error::validation(format!(
                "backup file {} is {:?}, only complete backups can be restored",
                file.id, file.status
            )));
        }
        if file.app_id != unit.app_id {
            return Err(Error::validation(format!(
                "backup file {} belongs to another application",
                file.id
            )));
        }

        let task = self.start_task("restore_unit", &unit.id).await?;
        let response = TaskObjectResponse {
            object_id: unit.id.clone(),
            object_name: unit.name.clone(),
            task_id: task.id.clone(),
        };

        let started = Instant::now();
        let engine = self.clone();
        let wait = self.tasks.new_wait_task(
            &unit.app_id,
            self.config.poll_interval(),
            updater(move |result| async move {
                engine.finish_task(task, started, &result).await;
            }),
        );

        let token = wait.token();
        let engine = self.clone();
        let unit_id = unit.id;
        let timeout = self.config.job_timeout() + self.config.retry_budget();
        wait.with_timeout(timeout, move || {
            let engine = engine.clone();
            let unit_id = unit_id.clone();
            let file = file.clone();
            let token = token.clone();
            async move { engine.restore(&unit_id, &file, &token).await.map(|()| true) }
        });
        Ok(response)
    }

    async fn restore(&self, unit_id: &str, file: &BackupFile, token: &CancellationToken) -> Result<()> {
        let mut unit = self.store.get_unit(unit_id).await?;
        let _guard = self.lock_app(&unit.app_id, token).await?;
        let orch = self.orchestrator(&unit.site_id)?;
        let window = self.config.unit_wait_timeout();

        ignore_not_found(orch.delete_unit(&unit.name).await)?;
        self.wait_unit_gone(orch.as_ref(), &unit.name, window, token)
            .await?;

        let key = JobKey::new(&self.config.namespace, format!("restore-{}-{}", unit.name, short_id()));
        let spec = JobSpec {
            key: key.clone(),
            image: self.config.backup_image.clone(),
            command: vec![
                "restore".to_string(),
                "--backup".to_string(),
                file.job.clone(),
                "--unit".to_string(),
                unit.name.clone(),
            ],
            host: Some(unit.host_name.clone()),
            claims: unit.claim_name().into_iter().collect(),
            local_dirs: unit
                .local_data_dir(&self.config.local_data_root)
                .into_iter()
                .collect(),
            labels: job_labels("restore", &unit),
        };
        orch.create_job(&spec).await?;

        let outcome = self.await_job(orch.as_ref(), &key, token).await;
        let cleanup = ignore_not_found(orch.delete_job(&key).await);
        outcome?;
        cleanup?;

        let (status, _) = self.recreate_with_retry(orch.as_ref(), &unit, token).await?;
        unit.ip = status.ip;
        self.store.update_unit(&unit).await?;
        info!(unit = %unit.name, backup = %file.job, "Unit restored");
        Ok(())
    }

    /// Poll a job until it finishes
    ///
    /// Transient lookup failures are retried up to `retry_times` in a row;
    /// the job itself gets `job_timeout`.
    async fn await_job(&self, orch: &dyn Orchestrator, key: &JobKey, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.config.job_timeout();
        let interval = self.config.retry_interval().max(Duration::from_millis(1));
        let mut failures = 0;

        loop {
            match orch.get_job(key).await {
                Ok(status) => {
                    failures = 0;
                    match status.phase {
                        JobPhase::Complete => return Ok(()),
                        JobPhase::Failed => {
                            return Err(Error::orchestrator(format!("job {key} failed")))
                        }
                        JobPhase::Active => {}
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.retry_times.max(1) {
                        return Err(e);
                    }
                    warn!(job = %key, failures, error = %e, "Job lookup failed, retrying");
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    after: self.config.job_timeout(),
                    what: format!("job {key}"),
                });
            }
            self.sleep_or_cancel(interval, token).await?;
        }
    }
}
