//! In-place resource resize of one service

use super::Engine;
use crate::models::{selector, AppState, ServiceType, TaskObjectResponse, Unit};
use crate::scheduler::check_growth;
use crate::wait::updater;
use crate::{Error, Result};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl Engine {
    /// Change the cpu and memory of every unit of a service
    ///
    /// Growth is checked against each host's free capacity before anything
    /// changes. Units are resized one at a time while their hosts are held
    /// unschedulable.
    pub async fn resize_app(
        &self,
        app_id: &str,
        service_type: ServiceType,
        cpu_milli: u64,
        memory_mib: u64,
    ) -> Result<TaskObjectResponse> {
        let app = self.store.get_app(app_id).await?;
        if matches!(app.state, AppState::Preparing | AppState::Orchestrating) {
            return Err(Error::validation(format!(
                "application {} is still being deployed",
                app.name
            )));
        }
        if cpu_milli == 0 || memory_mib == 0 {
            return Err(Error::validation("cpu and memory must be positive"));
        }
        let Some((_, service)) = app
            .spec
            .services()
            .into_iter()
            .find(|(t, _)| *t == service_type)
        else {
            return Err(Error::validation(format!(
                "application {} has no {service_type} service",
                app.name
            )));
        };

        let units = self.service_units(app_id, service_type).await?;
        if units.is_empty() {
            return Err(Error::validation(format!(
                "application {} has no {service_type} units",
                app.name
            )));
        }

        let cpu_growth = cpu_milli.saturating_sub(service.cpu_milli);
        let memory_growth = memory_mib.saturating_sub(service.memory_mib);
        if cpu_growth > 0 || memory_growth > 0 {
            let mut per_host: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
            for unit in &units {
                let entry = per_host.entry(unit.host_id.as_str()).or_default();
                entry.0 += cpu_growth;
                entry.1 += memory_growth;
            }
            for (host_id, (cpu, memory)) in per_host {
                let host = self.catalog.hosts.get_host_brief(host_id).await?;
                if let Err(e) = check_growth(&host, cpu, memory) {
                    self.metrics.inc_admission_rejections();
                    self.logger.log_admission_rejected(&app.name, &e.to_string());
                    return Err(e.into());
                }
            }
        }

        let task = self.start_task("resize_app", &app.id).await?;
        let response = TaskObjectResponse {
            object_id: app.id.clone(),
            object_name: app.name.clone(),
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
        let app_id = app.id;
        wait.with_timeout(self.config.resize_timeout(), move || {
            let engine = engine.clone();
            let app_id = app_id.clone();
            let token = token.clone();
            async move {
                engine
                    .resize(&app_id, service_type, cpu_milli, memory_mib, &token)
                    .await
                    .map(|()| true)
            }
        });
        Ok(response)
    }

    async fn service_units(&self, app_id: &str, service_type: ServiceType) -> Result<Vec<Unit>> {
        self.store
            .list_units(&selector([
                ("app_id", app_id),
                ("service_type", service_type.as_str()),
            ]))
            .await
    }

    async fn resize(
        &self,
        app_id: &str,
        service_type: ServiceType,
        cpu_milli: u64,
        memory_mib: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        let _guard = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled("resize cancelled".to_string())),
            guard = self.locks.lock(app_id) => guard,
        };

        let units = self.service_units(app_id, service_type).await?;

        let mut held: Vec<(String, String, bool)> = Vec::new();
        for unit in &units {
            if held.iter().any(|(site, host, _)| *site == unit.site_id && *host == unit.host_name) {
                continue;
            }
            let orch = self.orchestrator(&unit.site_id)?;
            match orch.set_host_unschedulable(&unit.host_name, true).await {
                Ok(previous) => held.push((unit.site_id.clone(), unit.host_name.clone(), previous)),
                Err(e) => {
                    self.restore_hosts(&held).await;
                    return Err(e);
                }
            }
        }

        let result = self.resize_units(&units, cpu_milli, memory_mib, token).await;
        self.restore_hosts(&held).await;
        result?;

        let mut app = self.store.get_app(app_id).await?;
        if let Some(service) = app.spec.service_mut(service_type) {
            service.cpu_milli = cpu_milli;
            service.memory_mib = memory_mib;
        }
        self.store.update_app(&app).await?;
        info!(app_id = %app_id, service = %service_type, cpu_milli, memory_mib, "Service resized");
        Ok(())
    }

    async fn resize_units(
        &self,
        units: &[Unit],
        cpu_milli: u64,
        memory_mib: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        for unit in units {
            let orch = self.orchestrator(&unit.site_id)?;
            let mut spec = orch.get_unit_spec(&unit.name).await?;
            spec.resources.cpu_milli = cpu_milli;
            spec.resources.memory_mib = memory_mib;
            orch.replace_unit(&spec).await?;

            let status = self
                .wait_unit_ready(orch.as_ref(), &unit.name, self.config.unit_wait_timeout(), token)
                .await?;

            let mut resized = unit.clone();
            resized.resources.cpu_milli = cpu_milli;
            resized.resources.memory_mib = memory_mib;
            if status.ip.is_some() {
                resized.ip = status.ip;
            }
            self.store.update_unit(&resized).await?;
            self.track_usage(&unit.host_id, Some(&unit.resources), Some(&resized.resources))
                .await;
        }
        Ok(())
    }

    /// Put every held host back to its previous scheduling state
    async fn restore_hosts(&self, held: &[(String, String, bool)]) {
        for (site, host, previous) in held.iter().rev() {
            let restored = match self.orchestrator(site) {
                Ok(orch) => orch.set_host_unschedulable(host, *previous).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = restored {
                warn!(host = %host, error = %e, "Failed to restore host scheduling state");
            }
        }
    }
}
