//! Persistence model for applications, units, tasks and backup files
//!
//! Rows are keyed by opaque string ids. Inserting an existing id is a
//! `Conflict`, updating or deleting a missing one is `NotFound`.

mod memory;

pub use memory::MemoryStore;

use crate::models::{Application, BackupFile, Selector, Task, Unit};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_app(&self, app: &Application) -> Result<()>;
    async fn update_app(&self, app: &Application) -> Result<()>;
    async fn get_app(&self, id: &str) -> Result<Application>;
    async fn list_apps(&self, selector: &Selector) -> Result<Vec<Application>>;
    async fn delete_app(&self, id: &str) -> Result<()>;

    async fn insert_unit(&self, unit: &Unit) -> Result<()>;
    async fn update_unit(&self, unit: &Unit) -> Result<()>;
    async fn get_unit(&self, id: &str) -> Result<Unit>;
    async fn list_units(&self, selector: &Selector) -> Result<Vec<Unit>>;
    async fn delete_unit(&self, id: &str) -> Result<()>;

    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;

    async fn insert_backup_file(&self, file: &BackupFile) -> Result<()>;
    async fn update_backup_file(&self, file: &BackupFile) -> Result<()>;
    async fn get_backup_file(&self, id: &str) -> Result<BackupFile>;
    async fn list_backup_files(&self, selector: &Selector) -> Result<Vec<BackupFile>>;
}
