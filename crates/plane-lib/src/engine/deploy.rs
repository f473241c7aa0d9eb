//! Application deployment
//!
//! `add_app` admits the whole footprint before anything is written, then
//! deploys every group concurrently inside one wait task. Replication and
//! link initialization run only once every group has reported success.

use super::validate::{group_requests, validate_app, GroupRequest};
use super::{claim_spec, Engine, FanIn, PLACEMENT_LOCK};
use crate::models::{
    selector, unit_name, unit_ordinal, AppSpec, AppState, Application, GroupState, HostBrief,
    ResourceRequest, ServiceType, Task, TaskObjectResponse, Unit,
};
use crate::orchestrator::{ignore_not_found, Orchestrator};
use crate::scheduler::{Placement, ScheduleRequest, Slot};
use crate::wait::updater;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one group deployment produced
#[derive(Debug)]
struct GroupReport {
    group: String,
    service_type: ServiceType,
    units: Vec<Unit>,
    error: Option<Error>,
}

/// Name of the config map holding an application's service endpoints
pub fn links_config_name(app_name: &str) -> String {
    format!("{app_name}-links")
}

impl Engine {
    /// Validate, admit and start deploying an application
    pub async fn add_app(&self, spec: AppSpec) -> Result<TaskObjectResponse> {
        let groups = validate_app(self.catalog.images.as_ref(), &spec).await?;

        let _naming = self.locks.lock(&format!("app-name:{}", spec.name)).await;
        let existing = self
            .store
            .list_apps(&selector([("name", spec.name.as_str())]))
            .await?;
        if !existing.is_empty() {
            return Err(Error::Conflict(format!("application '{}'", spec.name)));
        }

        if let Err(e) = self.preflight(&groups).await {
            self.logger.log_admission_rejected(&spec.name, &e.to_string());
            return Err(e);
        }

        let mut app = Application::new(spec);
        app.groups = groups
            .iter()
            .map(|g| (g.name.clone(), GroupState::Preparing))
            .collect();
        self.store.insert_app(&app).await?;

        let task = self.start_task("add_app", &app.id).await?;
        app.task_id = Some(task.id.clone());
        self.store.update_app(&app).await?;

        let response = TaskObjectResponse {
            object_id: app.id.clone(),
            object_name: app.name.clone(),
            task_id: task.id.clone(),
        };
        self.spawn_deploy(app.id, task);
        Ok(response)
    }

    /// Re-run deployment for an application left in `Warning`
    ///
    /// Groups already passing are skipped; dead units of the others are
    /// evicted and replaced.
    pub async fn retry_app(&self, app_id: &str) -> Result<TaskObjectResponse> {
        let mut app = self.store.get_app(app_id).await?;
        if app.state != AppState::Warning {
            return Err(Error::validation(format!(
                "application {} is {:?}, only applications in warning can be redeployed",
                app.name, app.state
            )));
        }
        if self.tasks.is_active(&app.id) {
            return Err(Error::Conflict(format!("task for application '{}'", app.name)));
        }

        let task = self.start_task("retry_app", &app.id).await?;
        app.task_id = Some(task.id.clone());
        self.store.update_app(&app).await?;

        let response = TaskObjectResponse {
            object_id: app.id.clone(),
            object_name: app.name.clone(),
            task_id: task.id.clone(),
        };
        self.spawn_deploy(app.id, task);
        Ok(response)
    }

    /// Admit every group's requests against the union of candidate hosts
    async fn preflight(&self, groups: &[GroupRequest]) -> Result<()> {
        let mut hosts: BTreeMap<String, HostBrief> = BTreeMap::new();
        let mut requests = Vec::new();

        for group in groups {
            let plans = self
                .scheduler
                .search(&group.schedule_request(group.replicas, Vec::new()))
                .await?;
            if plans.is_empty() {
                return Err(Error::validation(format!(
                    "no plan matched for group {}",
                    group.name
                )));
            }
            for host in plans.iter().flat_map(|p| p.hosts()) {
                hosts.entry(host.id.clone()).or_insert(host);
            }
            requests.extend(std::iter::repeat(group.request.clone()).take(group.replicas as usize));
        }

        let hosts: Vec<HostBrief> = hosts.into_values().collect();
        self.scheduler.preflight(&requests, &hosts)?;
        Ok(())
    }

    fn spawn_deploy(&self, app_id: String, task: Task) {
        let started = Instant::now();
        let timeout = self.config.ready_timeout() * 3;
        let deadline = started + timeout;

        let engine = self.clone();
        let id = app_id.clone();
        let wait = self.tasks.new_wait_task(
            &app_id,
            self.config.poll_interval(),
            updater(move |result| async move {
                engine.finish_deploy(&id, task, started, result).await;
            }),
        );

        let token = wait.token();
        let engine = self.clone();
        wait.with_timeout(timeout, move || {
            let engine = engine.clone();
            let app_id = app_id.clone();
            let token = token.clone();
            async move { engine.deploy(&app_id, &token, deadline).await.map(|()| true) }
        });
    }

    async fn finish_deploy(
        &self,
        app_id: &str,
        task: Task,
        started: Instant,
        result: Result<()>,
    ) {
        if result.is_err() {
            match self.store.get_app(app_id).await {
                Ok(mut app)
                    if matches!(app.state, AppState::Preparing | AppState::Orchestrating) =>
                {
                    app.state = AppState::Warning;
                    if let Err(e) = self.store.update_app(&app).await {
                        warn!(app_id = %app_id, error = %e, "Failed to mark application warning");
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => debug!(app_id = %app_id, "Application deleted during deployment"),
                Err(e) => warn!(app_id = %app_id, error = %e, "Failed to load application"),
            }
        }
        self.finish_task(task, started, &result).await;
    }

    async fn deploy(&self, app_id: &str, token: &CancellationToken, deadline: Instant) -> Result<()> {
        let _guard = self.lock_app(app_id, token).await?;
        let mut app = self.store.get_app(app_id).await?;
        app.state = AppState::Orchestrating;
        for state in app.services.values_mut() {
            if *state != AppState::Passing {
                *state = AppState::Orchestrating;
            }
        }

        let mut fanin = FanIn::new().with_grace(self.config.unit_wait_timeout());
        for group in group_requests(&app.spec) {
            if app.groups.get(&group.name) == Some(&GroupState::Passing) {
                continue;
            }
            app.groups.insert(group.name.clone(), GroupState::Orch);
            let engine = self.clone();
            let app_id = app.id.clone();
            let token = token.clone();
            fanin.spawn(async move { engine.deploy_group(&app_id, group, &token, deadline).await });
        }
        self.store.update_app(&app).await?;
        info!(app_id = %app.id, groups = fanin.expected(), "Deploying groups");

        let reports = fanin.collect("group deployment", deadline, token).await?;

        let mut errors = Vec::new();
        for report in reports {
            let ok = report.error.is_none();
            self.logger
                .log_group_reported(&app.id, &report.group, report.units.len(), ok);
            let state = if ok { GroupState::Passing } else { GroupState::Warning };
            app.groups.insert(report.group, state);
            if let Some(e) = report.error {
                app.services.insert(report.service_type, AppState::Warning);
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            app.state = AppState::Warning;
            self.store.update_app(&app).await?;
            return Err(Error::Aggregate(errors));
        }
        self.store.update_app(&app).await?;

        if let Err(e) = self.post_deploy(&mut app).await {
            app.state = AppState::Critical;
            if let Err(persist) = self.store.update_app(&app).await {
                warn!(app_id = %app.id, error = %persist, "Failed to mark application critical");
            }
            return Err(e);
        }

        app.state = AppState::Passing;
        self.store.update_app(&app).await
    }

    async fn deploy_group(
        &self,
        app_id: &str,
        group: GroupRequest,
        token: &CancellationToken,
        deadline: Instant,
    ) -> GroupReport {
        let mut units = Vec::new();
        let error = self
            .realize_group(app_id, &group, token, deadline, &mut units)
            .await
            .err();
        GroupReport {
            group: group.name,
            service_type: group.service_type,
            units,
            error,
        }
    }

    /// Bring a group to its replica count, collecting its ready units
    async fn realize_group(
        &self,
        app_id: &str,
        group: &GroupRequest,
        token: &CancellationToken,
        deadline: Instant,
        ready: &mut Vec<Unit>,
    ) -> Result<()> {
        let existing = self
            .store
            .list_units(&selector([("app_id", app_id), ("group", group.name.as_str())]))
            .await?;

        let mut kept = Vec::with_capacity(existing.len());
        for unit in existing {
            let orch = self.orchestrator(&unit.site_id)?;
            match orch.get_unit(&unit.name).await {
                Ok(status) if !status.is_dead() => kept.push(unit),
                Ok(status) => {
                    self.evict(orch.as_ref(), &unit, &format!("{:?}", status.phase))
                        .await?
                }
                Err(e) if e.is_not_found() => self.evict(orch.as_ref(), &unit, "missing").await?,
                Err(e) => return Err(e),
            }
        }

        let missing = group.replicas.saturating_sub(kept.len() as u32);
        let mut units = kept;
        if missing > 0 {
            let exclude = if group.conditions.host.high_availability {
                units.iter().map(|u| u.host_id.clone()).collect()
            } else {
                Vec::new()
            };
            let request = group.schedule_request(missing, exclude);
            let slots = self.reserve_placement(&request).await?.slots;

            let used: BTreeSet<u32> = units.iter().filter_map(|u| unit_ordinal(&u.name)).collect();
            let mut ordinals = (0u32..).filter(|n| !used.contains(n));
            for (i, slot) in slots.iter().enumerate() {
                let created = match ordinals.next() {
                    Some(ordinal) => {
                        let unit = Unit {
                            id: uuid::Uuid::new_v4().to_string(),
                            name: unit_name(&group.name, ordinal),
                            app_id: app_id.to_string(),
                            group: group.name.clone(),
                            service_type: group.service_type,
                            image: group.image.clone(),
                            site_id: slot.site_id.clone(),
                            cluster_id: slot.cluster_id.clone(),
                            host_id: slot.host.id.clone(),
                            host_name: slot.host.name.clone(),
                            network_id: slot.network_id.clone(),
                            ip: None,
                            port: group.service_type.default_port(),
                            resources: group.request.clone(),
                            storage: group.storage.clone(),
                            created_at: chrono::Utc::now(),
                        };
                        self.create_unit(&unit).await.map(|()| unit)
                    }
                    None => Err(Error::Internal("unit ordinals exhausted".to_string())),
                };
                match created {
                    Ok(unit) => units.push(unit),
                    Err(e) => {
                        self.release_slots(&slots[i..], &group.request).await;
                        return Err(e);
                    }
                }
            }
        }

        let timed_out = self.await_group(units, token, deadline, ready).await?;

        for unit in ready.iter() {
            self.store.update_unit(unit).await?;
            if let Err(e) = self.monitor.register(unit).await {
                warn!(unit = %unit.name, error = %e, "Failed to register unit with monitoring");
            }
        }

        let have = ready.len() as u32;
        if have >= group.replicas {
            return Ok(());
        }
        let what = format!("group {}: {have} of {} units ready", group.name, group.replicas);
        if timed_out {
            Err(Error::Timeout {
                after: self.config.unit_wait_timeout(),
                what,
            })
        } else {
            Err(Error::orchestrator(what))
        }
    }

    /// Schedule a request and charge every chosen slot to its host
    ///
    /// Concurrent placements are serialized so each one sees the usage the
    /// previous ones charged.
    async fn reserve_placement(&self, request: &ScheduleRequest) -> Result<Placement> {
        let _placing = self.locks.lock(PLACEMENT_LOCK).await;
        let placement = self.scheduler.schedule(request).await?;
        for (i, slot) in placement.slots.iter().enumerate() {
            if let Err(e) = self
                .adjust_host_usage(&slot.host.id, None, Some(&request.request))
                .await
            {
                self.release_slots(&placement.slots[..i], &request.request).await;
                return Err(e);
            }
        }
        Ok(placement)
    }

    /// Return reserved capacity of slots that never got a unit
    async fn release_slots(&self, slots: &[Slot], request: &ResourceRequest) {
        for slot in slots {
            self.track_usage(&slot.host.id, Some(request), None).await;
        }
    }

    /// Create a unit, its volume claim and its row
    ///
    /// The unit's host must already carry its reservation.
    async fn create_unit(&self, unit: &Unit) -> Result<()> {
        let orch = self.orchestrator(&unit.site_id)?;
        if let Some(claim) = claim_spec(unit) {
            match orch.create_claim(&claim).await {
                Err(e) if e.is_conflict() => debug!(claim = %claim.name, "Reusing existing claim"),
                other => other?,
            }
        }

        let spec = self.unit_spec(unit);
        match orch.create_unit(&spec).await {
            Err(e) if e.is_conflict() => {
                debug!(unit = %unit.name, "Replacing stale unit");
                orch.replace_unit(&spec).await?;
            }
            other => other?,
        }

        self.store.insert_unit(unit).await
    }

    /// Wait for every unit to become ready within a fresh window
    ///
    /// Units that terminate or disappear are evicted at once; units still
    /// not ready when the window closes are evicted as well. Returns
    /// whether any unit ran out of time.
    async fn await_group(
        &self,
        mut pending: Vec<Unit>,
        token: &CancellationToken,
        deadline: Instant,
        ready: &mut Vec<Unit>,
    ) -> Result<bool> {
        let window_end = (Instant::now() + self.config.unit_wait_timeout()).min(deadline);

        loop {
            let mut waiting = Vec::with_capacity(pending.len());
            for mut unit in pending {
                let orch = self.orchestrator(&unit.site_id)?;
                match orch.get_unit(&unit.name).await {
                    Ok(status) if status.is_ready() => {
                        unit.ip = status.ip;
                        ready.push(unit);
                    }
                    Ok(status) if status.is_dead() => {
                        self.evict(orch.as_ref(), &unit, "terminated").await?
                    }
                    Ok(_) => waiting.push(unit),
                    Err(e) if e.is_not_found() => {
                        self.evict(orch.as_ref(), &unit, "disappeared").await?
                    }
                    Err(e) => return Err(e),
                }
            }
            pending = waiting;

            if pending.is_empty() {
                return Ok(false);
            }
            if Instant::now() >= window_end {
                for unit in &pending {
                    let orch = self.orchestrator(&unit.site_id)?;
                    self.evict(orch.as_ref(), unit, "not ready within wait window")
                        .await?;
                }
                return Ok(true);
            }

            let next = (Instant::now() + self.config.poll_interval()).min(window_end);
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Cancelled("group deployment cancelled".to_string()));
                }
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }

    /// Delete a dead unit and everything it owns
    pub(super) async fn evict(&self, orch: &dyn Orchestrator, unit: &Unit, reason: &str) -> Result<()> {
        ignore_not_found(orch.delete_unit(&unit.name).await)?;
        self.release_claim(orch, unit).await?;
        match self.store.delete_unit(&unit.id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.track_usage(&unit.host_id, Some(&unit.resources), None)
            .await;
        if let Err(e) = self.monitor.deregister(unit).await {
            warn!(unit = %unit.name, error = %e, "Failed to deregister unit from monitoring");
        }

        self.metrics.inc_units_evicted();
        self.logger.log_unit_evicted(&unit.app_id, &unit.name, reason);
        Ok(())
    }

    /// Delete a unit's volume claim and the volume bound to it
    pub(super) async fn release_claim(&self, orch: &dyn Orchestrator, unit: &Unit) -> Result<()> {
        if let Some(claim) = unit.claim_name() {
            let volume = ignore_not_found(orch.delete_claim(&self.config.namespace, &claim).await)?;
            if let Some(volume) = volume {
                ignore_not_found(orch.delete_volume(&volume).await)?;
            }
        }
        Ok(())
    }

    async fn post_deploy(&self, app: &mut Application) -> Result<()> {
        let units = self
            .store
            .list_units(&selector([("app_id", app.id.as_str())]))
            .await?;

        let mut databases: BTreeMap<&str, Vec<&Unit>> = BTreeMap::new();
        for unit in units.iter().filter(|u| u.service_type == ServiceType::Mysql) {
            databases.entry(unit.group.as_str()).or_default().push(unit);
        }
        for (group, mut members) in databases {
            members.sort_by(|a, b| a.name.cmp(&b.name));
            self.init_replication(&members).await?;
            debug!(app_id = %app.id, group = %group, "Replication initialized");
        }
        app.services.insert(ServiceType::Mysql, AppState::Passing);
        self.store.update_app(app).await?;

        if app.uses_cmha() {
            self.init_links(app, &units).await?;
            app.services.insert(ServiceType::Cmha, AppState::Passing);
            app.services.insert(ServiceType::Proxysql, AppState::Passing);
            self.store.update_app(app).await?;
        }
        Ok(())
    }

    /// The first unit by name is the source, the rest replicate from it
    async fn init_replication(&self, members: &[&Unit]) -> Result<()> {
        let (source, replicas) = members
            .split_first()
            .ok_or_else(|| Error::Internal("database group without units".to_string()))?;
        let source_ip = source
            .ip
            .clone()
            .ok_or_else(|| Error::Internal(format!("unit {} has no address", source.name)))?;
        let source_port = source.port.to_string();

        let orch = self.orchestrator(&source.site_id)?;
        self.exec_ctl(orch.as_ref(), &source.name, &["replication", "init-source"])
            .await?;

        for replica in replicas {
            let orch = self.orchestrator(&replica.site_id)?;
            self.exec_ctl(
                orch.as_ref(),
                &replica.name,
                &[
                    "replication",
                    "set-source",
                    "--host",
                    &source_ip,
                    "--port",
                    &source_port,
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Publish every service's endpoints and point each unit at them
    async fn init_links(&self, app: &Application, units: &[Unit]) -> Result<()> {
        let endpoints = |service_type: ServiceType| {
            let mut addrs: Vec<String> = units
                .iter()
                .filter(|u| u.service_type == service_type)
                .filter_map(Unit::endpoint)
                .collect();
            addrs.sort();
            addrs.join(",")
        };
        let data: BTreeMap<String, String> = [ServiceType::Mysql, ServiceType::Cmha, ServiceType::Proxysql]
            .into_iter()
            .map(|t| (t.to_string(), endpoints(t)))
            .collect();

        let name = links_config_name(&app.name);
        let sites: BTreeSet<&str> = units.iter().map(|u| u.site_id.as_str()).collect();
        for site in sites {
            self.orchestrator(site)?
                .apply_config_map(&name, data.clone())
                .await?;
        }
        for unit in units {
            let orch = self.orchestrator(&unit.site_id)?;
            self.exec_ctl(orch.as_ref(), &unit.name, &["links", "init", "--config", &name])
                .await?;
        }
        Ok(())
    }
}
