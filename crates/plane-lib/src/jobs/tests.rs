use super::*;
use crate::orchestrator::{ClaimSpec, JobSpec, MemoryOrchestrator};
use crate::Error;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct RecordingCallback {
    running: DashMap<String, bool>,
    completed: DashMap<String, (JobPhase, u64)>,
    fail_next: AtomicU32,
}

impl RecordingCallback {
    fn expect(&self, job: &str) {
        self.running.insert(job.to_string(), true);
    }
}

#[async_trait]
impl BackupCallback for RecordingCallback {
    async fn is_running(&self, job: &str) -> Result<bool> {
        self.running
            .get(job)
            .map(|r| *r)
            .ok_or_else(|| Error::not_found("backup file", job))
    }

    async fn complete(&self, job: &str, phase: JobPhase, size: u64) -> Result<()> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Internal("store unavailable".into()));
        }
        self.running.insert(job.to_string(), false);
        self.completed.insert(job.to_string(), (phase, size));
        Ok(())
    }
}

fn config() -> JobControllerConfig {
    JobControllerConfig {
        base_backoff_ms: 10,
        max_backoff_ms: 40,
        workers: 2,
    }
}

async fn backup_job(orch: &MemoryOrchestrator, name: &str) -> JobKey {
    let key = JobKey::new("default", name);
    let claim = format!("{name}-data");
    orch.create_claim(&ClaimSpec {
        name: claim.clone(),
        storage_class: None,
        size_mib: 1024,
    })
    .await
    .unwrap();
    orch.create_job(&JobSpec {
        key: key.clone(),
        image: "dbplane/backup:latest".into(),
        command: vec!["backup".into()],
        host: None,
        claims: vec![claim],
        local_dirs: Vec::new(),
        labels: BTreeMap::new(),
    })
    .await
    .unwrap();
    key
}

fn controller(orch: Arc<MemoryOrchestrator>, callback: Arc<RecordingCallback>) -> JobController {
    JobController::new(
        &config(),
        orch,
        callback,
        PlaneMetrics::new(),
        StructuredLogger::new("test"),
    )
}

#[test]
fn test_parse_backup_size_takes_last_match() {
    let logs = "starting\nSize: 100\ncopying\nsize: 2048 \ndone";
    assert_eq!(parse_backup_size(logs), Some(2048));
    assert_eq!(parse_backup_size("BACKUP SIZE: 77"), Some(77));
    assert_eq!(parse_backup_size("size: unknown"), None);
    assert_eq!(parse_backup_size(""), None);
}

#[tokio::test]
async fn test_active_job_is_left_alone() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    let key = backup_job(&orch, "backup-a").await;
    callback.expect("backup-a");

    controller(orch.clone(), callback.clone())
        .reconcile(&key)
        .await
        .unwrap();
    assert!(callback.completed.is_empty());
    assert!(orch.has_claim("backup-a-data"));
}

#[tokio::test]
async fn test_complete_job_reports_size_and_cleans_up() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    let key = backup_job(&orch, "backup-a").await;
    callback.expect("backup-a");
    orch.set_pod_logs("default", "backup-a-pod", "dumping\nsize: 4096\n");
    orch.set_job_phase(&key, JobPhase::Complete);

    controller(orch.clone(), callback.clone())
        .reconcile(&key)
        .await
        .unwrap();

    assert_eq!(
        *callback.completed.get("backup-a").unwrap(),
        (JobPhase::Complete, 4096)
    );
    assert!(!orch.has_claim("backup-a-data"));
    assert!(!orch.has_volume("pv-backup-a-data"));
    assert_eq!(orch.pod_count(), 0);
}

#[tokio::test]
async fn test_unknown_or_finished_backups_are_skipped() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    let unknown = backup_job(&orch, "restore-x").await;
    orch.set_job_phase(&unknown, JobPhase::Complete);

    let done = backup_job(&orch, "backup-b").await;
    orch.set_job_phase(&done, JobPhase::Failed);
    callback.running.insert("backup-b".into(), false);

    let controller = controller(orch.clone(), callback.clone());
    controller.reconcile(&unknown).await.unwrap();
    controller.reconcile(&done).await.unwrap();

    assert!(callback.completed.is_empty());
    assert!(orch.has_claim("restore-x-data"));
    assert!(!orch.has_claim("backup-b-data"));
}

#[tokio::test]
async fn test_missing_job_is_not_an_error() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    controller(orch, callback)
        .reconcile(&JobKey::new("default", "gone"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_retries_failed_reconcile_until_it_succeeds() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    callback.fail_next.store(2, Ordering::SeqCst);
    let key = backup_job(&orch, "backup-c").await;
    callback.expect("backup-c");
    orch.set_pod_logs("default", "backup-c-pod", "size: 9");
    orch.set_job_phase(&key, JobPhase::Complete);

    let controller = controller(orch.clone(), callback.clone());
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let running = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(rx, shutdown).await })
    };

    tx.send(JobEvent::Updated(key.clone())).await.unwrap();
    tx.send(JobEvent::Updated(key.clone())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !callback.completed.contains_key("backup-c") {
        assert!(tokio::time::Instant::now() < deadline, "job never reconciled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*callback.completed.get("backup-c").unwrap(), (JobPhase::Complete, 9));

    shutdown.cancel();
    running.await.unwrap();
    assert_eq!(controller.queue().failures(&key), 0);
}

#[tokio::test]
async fn test_reconcile_outcomes_drive_controller_health() {
    let orch = Arc::new(MemoryOrchestrator::default());
    let callback = Arc::new(RecordingCallback::default());
    callback.fail_next.store(1, Ordering::SeqCst);
    let key = backup_job(&orch, "backup-d").await;
    callback.expect("backup-d");
    orch.set_job_phase(&key, JobPhase::Complete);

    let health = HealthRegistry::new();
    let controller = controller(orch, callback).with_health(health.clone());

    assert!(controller.reconcile_recorded(&key).await.is_err());
    let report = health.health().await;
    assert_eq!(
        report.components[components::JOB_CONTROLLER].status,
        crate::health::ComponentStatus::Degraded
    );

    controller.reconcile_recorded(&key).await.unwrap();
    let report = health.health().await;
    assert_eq!(
        report.components[components::JOB_CONTROLLER].status,
        crate::health::ComponentStatus::Healthy
    );
}
