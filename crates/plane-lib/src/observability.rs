//! Observability infrastructure for the control plane
//!
//! Provides:
//! - Prometheus metrics (admission latency, task duration and outcomes, wait tasks, job queue)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for admission simulation latency (in seconds)
const ADMISSION_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
];

/// Buckets for task duration (in seconds)
const TASK_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Option<PlaneMetricsInner>> = OnceLock::new();

struct PlaneMetricsInner {
    admission_latency_seconds: Histogram,
    task_duration_seconds: HistogramVec,
    task_outcomes: IntCounterVec,
    wait_tasks_active: IntGauge,
    job_queue_depth: IntGauge,
    admission_rejections: IntCounter,
    units_evicted: IntCounter,
    jobs_reconciled: IntCounterVec,
}

impl PlaneMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            admission_latency_seconds: register_histogram!(
                "dbplane_admission_latency_seconds",
                "Time spent simulating admission for a set of requests",
                ADMISSION_BUCKETS.to_vec()
            )?,

            task_duration_seconds: register_histogram_vec!(
                "dbplane_task_duration_seconds",
                "Wall-clock duration of orchestration tasks",
                &["action"],
                TASK_BUCKETS.to_vec()
            )?,

            task_outcomes: register_int_counter_vec!(
                "dbplane_task_outcomes_total",
                "Finished orchestration tasks by action and outcome",
                &["action", "outcome"]
            )?,

            wait_tasks_active: register_int_gauge!(
                "dbplane_wait_tasks_active",
                "Number of registered wait tasks"
            )?,

            job_queue_depth: register_int_gauge!(
                "dbplane_job_queue_depth",
                "Number of jobs waiting in the reconciliation queue"
            )?,

            admission_rejections: register_int_counter!(
                "dbplane_admission_rejections_total",
                "Requests rejected by the admission checker"
            )?,

            units_evicted: register_int_counter!(
                "dbplane_units_evicted_total",
                "Dead units deleted during deployment"
            )?,

            jobs_reconciled: register_int_counter_vec!(
                "dbplane_jobs_reconciled_total",
                "Jobs handed to the completion callback by terminal phase",
                &["phase"]
            )?,
        })
    }
}

/// Control plane metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics. If registration fails the handle records
/// nothing.
#[derive(Clone)]
pub struct PlaneMetrics {
    _private: (),
}

impl Default for PlaneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaneMetrics {
    /// Create a new metrics handle (registers global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match PlaneMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register metrics");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&PlaneMetricsInner> {
        GLOBAL_METRICS.get().and_then(|m| m.as_ref())
    }

    pub fn observe_admission_latency(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.admission_latency_seconds.observe(duration_secs);
        }
    }

    /// Record a finished task
    pub fn observe_task(&self, action: &str, outcome: &str, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.task_duration_seconds
                .with_label_values(&[action])
                .observe(duration_secs);
            m.task_outcomes.with_label_values(&[action, outcome]).inc();
        }
    }

    pub fn set_wait_tasks_active(&self, count: i64) {
        if let Some(m) = self.inner() {
            m.wait_tasks_active.set(count);
        }
    }

    pub fn set_job_queue_depth(&self, depth: i64) {
        if let Some(m) = self.inner() {
            m.job_queue_depth.set(depth);
        }
    }

    pub fn inc_admission_rejections(&self) {
        if let Some(m) = self.inner() {
            m.admission_rejections.inc();
        }
    }

    pub fn inc_units_evicted(&self) {
        if let Some(m) = self.inner() {
            m.units_evicted.inc();
        }
    }

    pub fn inc_jobs_reconciled(&self, phase: &str) {
        if let Some(m) = self.inner() {
            m.jobs_reconciled.with_label_values(&[phase]).inc();
        }
    }
}

/// Structured logger for control plane events
///
/// Emits one event per lifecycle transition, tagged with the site the
/// process manages.
#[derive(Clone)]
pub struct StructuredLogger {
    site: String,
}

impl StructuredLogger {
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into() }
    }

    pub fn log_task_started(&self, task_id: &str, action: &str, related_id: &str) {
        info!(
            event = "task_started",
            site = %self.site,
            task_id = %task_id,
            action = %action,
            related_id = %related_id,
            "Task started"
        );
    }

    pub fn log_task_finished(&self, task_id: &str, action: &str, error: Option<&str>) {
        match error {
            None => info!(
                event = "task_finished",
                site = %self.site,
                task_id = %task_id,
                action = %action,
                success = true,
                "Task finished"
            ),
            Some(error) => warn!(
                event = "task_finished",
                site = %self.site,
                task_id = %task_id,
                action = %action,
                success = false,
                error = %error,
                "Task failed"
            ),
        }
    }

    pub fn log_admission_rejected(&self, app: &str, reason: &str) {
        warn!(
            event = "admission_rejected",
            site = %self.site,
            app = %app,
            reason = %reason,
            "Admission rejected"
        );
    }

    pub fn log_group_reported(&self, app_id: &str, group: &str, units: usize, ok: bool) {
        if ok {
            info!(
                event = "group_reported",
                site = %self.site,
                app_id = %app_id,
                group = %group,
                units = units,
                ok = true,
                "Group deployed"
            );
        } else {
            warn!(
                event = "group_reported",
                site = %self.site,
                app_id = %app_id,
                group = %group,
                units = units,
                ok = false,
                "Group deployment fell short"
            );
        }
    }

    pub fn log_unit_evicted(&self, app_id: &str, unit: &str, reason: &str) {
        warn!(
            event = "unit_evicted",
            site = %self.site,
            app_id = %app_id,
            unit = %unit,
            reason = %reason,
            "Dead unit evicted"
        );
    }

    pub fn log_job_reconciled(&self, job: &str, phase: &str, size: u64) {
        info!(
            event = "job_reconciled",
            site = %self.site,
            job = %job,
            phase = %phase,
            size = size,
            "Job reconciled"
        );
    }

    pub fn log_startup(&self, version: &str, backend: &str) {
        info!(
            event = "daemon_started",
            site = %self.site,
            version = %version,
            backend = %backend,
            "Control plane daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            site = %self.site,
            reason = %reason,
            "Control plane daemon shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registration() {
        let first = PlaneMetrics::new();
        let second = PlaneMetrics::new();

        first.observe_admission_latency(0.0001);
        first.observe_task("add_app", "success", 1.5);
        second.set_wait_tasks_active(3);
        second.set_job_queue_depth(1);
        second.inc_admission_rejections();
        second.inc_units_evicted();
        second.inc_jobs_reconciled("complete");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("site-a");
        assert_eq!(logger.site, "site-a");
    }
}
