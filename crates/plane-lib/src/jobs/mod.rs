//! Job reconciliation controller
//!
//! Job events from the orchestrator land in a de-duplicating work queue.
//! Workers reconcile finished backup jobs: read the reported size from the
//! pod logs, hand the outcome to a [`BackupCallback`], then delete the
//! job's pods and claims. Failed reconciles are retried with exponential
//! backoff.

mod queue;

pub use queue::WorkQueue;

use crate::health::{components, HealthRegistry};
use crate::observability::{PlaneMetrics, StructuredLogger};
use crate::orchestrator::{ignore_not_found, JobKey, JobPhase, Orchestrator};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Change notification for a Job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Added(JobKey),
    Updated(JobKey),
    Deleted(JobKey),
}

impl JobEvent {
    pub fn key(&self) -> &JobKey {
        match self {
            JobEvent::Added(key) | JobEvent::Updated(key) | JobEvent::Deleted(key) => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobControllerConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub workers: usize,
}

impl Default for JobControllerConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 10_000,
            max_backoff_ms: 360_000,
            workers: 2,
        }
    }
}

/// Receives the outcome of finished backup jobs
#[async_trait]
pub trait BackupCallback: Send + Sync {
    /// Whether the job still awaits completion; `NotFound` for unknown jobs
    async fn is_running(&self, job: &str) -> Result<bool>;

    async fn complete(&self, job: &str, phase: JobPhase, size: u64) -> Result<()>;
}

/// Size reported by the last `size: <bytes>` line of a backup log
pub fn parse_backup_size(logs: &str) -> Option<u64> {
    logs.lines().rev().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let at = lower.find("size:")?;
        lower[at + "size:".len()..]
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    })
}

#[derive(Clone)]
pub struct JobController {
    orchestrator: Arc<dyn Orchestrator>,
    callback: Arc<dyn BackupCallback>,
    queue: WorkQueue<JobKey>,
    workers: usize,
    metrics: PlaneMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl JobController {
    pub fn new(
        config: &JobControllerConfig,
        orchestrator: Arc<dyn Orchestrator>,
        callback: Arc<dyn BackupCallback>,
        metrics: PlaneMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            orchestrator,
            callback,
            queue: WorkQueue::new(
                Duration::from_millis(config.base_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
                metrics.clone(),
            ),
            workers: config.workers.max(1),
            metrics,
            logger,
            health: None,
        }
    }

    /// Report every reconcile outcome as the controller's health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn queue(&self) -> &WorkQueue<JobKey> {
        &self.queue
    }

    /// Consume events until the channel closes or `shutdown` fires
    pub async fn run(&self, mut events: mpsc::Receiver<JobEvent>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let controller = self.clone();
            workers.spawn(async move { controller.work(worker).await });
        }
        info!(workers = self.workers, "Job controller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(JobEvent::Deleted(key)) => {
                        debug!(job = %key, "Job deleted");
                        self.queue.forget(&key);
                    }
                    Some(event) => self.queue.add(event.key().clone()),
                    None => break,
                },
            }
        }

        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Job worker ended abnormally");
            }
        }
        info!("Job controller stopped");
    }

    async fn work(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile_recorded(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(
                        worker,
                        job = %key,
                        failures = self.queue.failures(&key),
                        error = %e,
                        "Job reconcile failed, requeueing"
                    );
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile_recorded(&self, key: &JobKey) -> Result<()> {
        let outcome = self.reconcile(key).await;
        if let Some(health) = &self.health {
            health.observe(components::JOB_CONTROLLER, &outcome).await;
        }
        outcome
    }

    /// Bring one job's bookkeeping up to date
    pub async fn reconcile(&self, key: &JobKey) -> Result<()> {
        let status = match self.orchestrator.get_job(key).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => {
                debug!(job = %key, "Job no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !status.phase.is_terminal() {
            return Ok(());
        }

        let running = match self.callback.is_running(&key.name).await {
            Ok(running) => running,
            Err(e) if e.is_not_found() => {
                debug!(job = %key, "Job has no backup record");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let pods = self.orchestrator.job_pods(key).await?;
        if running {
            let mut size = 0;
            for pod in &pods {
                let logs =
                    ignore_not_found(self.orchestrator.pod_logs(&key.namespace, &pod.name).await)?;
                if let Some(reported) = parse_backup_size(&logs) {
                    size = reported;
                }
            }
            self.callback.complete(&key.name, status.phase, size).await?;
            self.metrics.inc_jobs_reconciled(status.phase.as_str());
            self.logger
                .log_job_reconciled(&key.to_string(), status.phase.as_str(), size);
        }

        // Runs on every pass for a finished job until nothing is left
        for pod in &pods {
            ignore_not_found(self.orchestrator.delete_pod(&key.namespace, &pod.name).await)?;
            for claim in &pod.claims {
                let volume =
                    ignore_not_found(self.orchestrator.delete_claim(&key.namespace, claim).await)?;
                if let Some(volume) = volume {
                    ignore_not_found(self.orchestrator.delete_volume(&volume).await)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
