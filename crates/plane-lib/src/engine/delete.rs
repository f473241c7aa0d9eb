//! Application teardown

use super::deploy::links_config_name;
use super::{Engine, FanIn};
use crate::models::{selector, TaskObjectResponse, Unit};
use crate::orchestrator::ignore_not_found;
use crate::wait::updater;
use crate::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl Engine {
    /// Cancel whatever runs for the application and tear it down
    pub async fn delete_app(&self, app_id: &str) -> Result<TaskObjectResponse> {
        let app = self.store.get_app(app_id).await?;

        let cancelled = self.tasks.cancel_task(&app.id);
        if cancelled > 0 {
            info!(app_id = %app.id, cancelled, "Cancelled in-flight tasks before delete");
        }

        let task = self.start_task("delete_app", &app.id).await?;
        let response = TaskObjectResponse {
            object_id: app.id.clone(),
            object_name: app.name.clone(),
            task_id: task.id.clone(),
        };

        let started = Instant::now();
        let timeout = self.config.delete_timeout();
        let deadline = started + timeout;

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
        wait.with_timeout(timeout, move || {
            let engine = engine.clone();
            let app_id = app_id.clone();
            let token = token.clone();
            async move { engine.remove_app(&app_id, &token, deadline).await.map(|()| true) }
        });
        Ok(response)
    }

    async fn remove_app(&self, app_id: &str, token: &CancellationToken, deadline: Instant) -> Result<()> {
        // Waits for a cancelled deployment to stop creating units
        let _guard = self.lock_app(app_id, token).await?;
        let app = match self.store.get_app(app_id).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let units = self
            .store
            .list_units(&selector([("app_id", app_id)]))
            .await?;

        let mut fanin = FanIn::new();
        for unit in units {
            let engine = self.clone();
            let token = token.clone();
            fanin.spawn(async move { engine.remove_unit(&unit, &token).await });
        }
        let expected = fanin.expected();
        let results = fanin.collect("unit deletion", deadline, token).await?;
        Error::collect(results.into_iter().filter_map(Result::err).collect())?;

        let config_map = links_config_name(&app.name);
        for site in self.orchestrators.sites() {
            let orch = self.orchestrator(&site)?;
            ignore_not_found(orch.delete_config_map(&config_map).await)?;
        }

        ignore_not_found(self.store.delete_app(app_id).await)?;
        self.locks.forget(app_id);
        info!(app_id = %app_id, units = expected, "Application deleted");
        Ok(())
    }

    /// Delete one unit and wait until the orchestrator no longer reports it
    async fn remove_unit(&self, unit: &Unit, token: &CancellationToken) -> Result<()> {
        let orch = self.orchestrator(&unit.site_id)?;
        ignore_not_found(orch.delete_unit(&unit.name).await)?;
        self.wait_unit_gone(orch.as_ref(), &unit.name, self.config.unit_wait_timeout(), token)
            .await?;
        self.release_claim(orch.as_ref(), unit).await?;

        self.track_usage(&unit.host_id, Some(&unit.resources), None)
            .await;
        if let Err(e) = self.monitor.deregister(unit).await {
            warn!(unit = %unit.name, error = %e, "Failed to deregister unit from monitoring");
        }
        ignore_not_found(self.store.delete_unit(&unit.id).await)
    }
}
