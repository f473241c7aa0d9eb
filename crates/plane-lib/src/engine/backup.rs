//! Backup file bookkeeping for the job controller

use crate::jobs::BackupCallback;
use crate::models::{selector, BackupFile, BackupFileStatus};
use crate::orchestrator::JobPhase;
use crate::store::Store;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Completes backup files in the store when their job finishes
pub struct StoreBackupCallback {
    store: Arc<dyn Store>,
}

impl StoreBackupCallback {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn file_for_job(&self, job: &str) -> Result<BackupFile> {
        self.store
            .list_backup_files(&selector([("job", job)]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("backup file", job))
    }
}

#[async_trait]
impl BackupCallback for StoreBackupCallback {
    async fn is_running(&self, job: &str) -> Result<bool> {
        let file = self.file_for_job(job).await?;
        Ok(file.status == BackupFileStatus::Running)
    }

    async fn complete(&self, job: &str, phase: JobPhase, size: u64) -> Result<()> {
        let mut file = self.file_for_job(job).await?;
        file.status = match phase {
            JobPhase::Complete => BackupFileStatus::Complete,
            JobPhase::Failed => BackupFileStatus::Failed,
            JobPhase::Active => {
                return Err(Error::Internal(format!("job {job} is still active")))
            }
        };
        file.size = size;
        file.finished_at = Some(chrono::Utc::now());
        self.store.update_backup_file(&file).await?;
        info!(job = %job, file_id = %file.id, size, status = ?file.status, "Backup file completed");
        Ok(())
    }
}
