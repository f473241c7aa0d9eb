//! Keyed registry of running wait tasks

use super::{Updater, WaitTask};
use crate::observability::PlaneMetrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Entries = DashMap<String, Vec<(u64, CancellationToken)>>;

/// Wait tasks grouped by the logical entity they act on
///
/// Cancelling a key cancels every task registered under it, so an
/// operation can supersede whatever else is in flight for the same
/// application.
#[derive(Clone)]
pub struct WaitTasks {
    entries: Arc<Entries>,
    next_id: Arc<AtomicU64>,
    metrics: PlaneMetrics,
}

impl WaitTasks {
    pub fn new(metrics: PlaneMetrics) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            metrics,
        }
    }

    /// Create a task and register it under `key`
    ///
    /// The entry is removed once the task's updater has run, or when the
    /// task is dropped without being started.
    pub fn new_wait_task(
        &self,
        key: impl Into<String>,
        interval: Duration,
        updater: Updater,
    ) -> WaitTask {
        let key = key.into();
        let mut task = WaitTask::new(key.clone(), interval, updater);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.entries
            .entry(key.clone())
            .or_default()
            .push((id, task.token()));
        self.metrics.set_wait_tasks_active(self.len() as i64);

        task.registration = Some(Registration {
            registry: self.clone(),
            key,
            id,
        });
        task
    }

    /// Cancel every task registered under `key`, returning how many
    pub fn cancel_task(&self, key: &str) -> usize {
        match self.entries.get(key) {
            Some(tasks) => {
                for (_, token) in tasks.iter() {
                    token.cancel();
                }
                debug!(key = %key, count = tasks.len(), "Cancelled wait tasks");
                tasks.len()
            }
            None => 0,
        }
    }

    /// Cancel and forget every task under `key`
    pub fn delete(&self, key: &str) -> usize {
        let cancelled = match self.entries.remove(key) {
            Some((_, tasks)) => {
                for (_, token) in &tasks {
                    token.cancel();
                }
                tasks.len()
            }
            None => 0,
        };
        self.metrics.set_wait_tasks_active(self.len() as i64);
        cancelled
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|tasks| !tasks.is_empty())
            .unwrap_or(false)
    }

    /// Number of registered tasks across all keys
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, key: &str, id: u64) {
        self.entries.remove_if_mut(key, |_, tasks| {
            tasks.retain(|(task_id, _)| *task_id != id);
            tasks.is_empty()
        });
        self.metrics.set_wait_tasks_active(self.len() as i64);
    }
}

/// Removes a task's registry entry when dropped
pub(super) struct Registration {
    registry: WaitTasks,
    key: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, self.id);
    }
}
