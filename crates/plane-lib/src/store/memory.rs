//! In-memory store backend

use super::Store;
use crate::models::{Application, BackupFile, Selectable, Selector, Task, Unit};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct MemoryStore {
    apps: DashMap<String, Application>,
    units: DashMap<String, Unit>,
    tasks: DashMap<String, Task>,
    backup_files: DashMap<String, BackupFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Task rows recorded for one related object
    pub fn tasks_for(&self, related_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.related_id == related_id)
            .map(|t| t.value().clone())
            .collect()
    }
}

fn insert<T: Clone>(map: &DashMap<String, T>, kind: &str, id: &str, row: &T) -> Result<()> {
    match map.entry(id.to_string()) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Conflict(format!("{kind} '{id}'"))),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(row.clone());
            Ok(())
        }
    }
}

fn update<T: Clone>(map: &DashMap<String, T>, kind: &'static str, id: &str, row: &T) -> Result<()> {
    match map.get_mut(id) {
        Some(mut existing) => {
            *existing = row.clone();
            Ok(())
        }
        None => Err(Error::not_found(kind, id)),
    }
}

fn get<T: Clone>(map: &DashMap<String, T>, kind: &'static str, id: &str) -> Result<T> {
    map.get(id)
        .map(|r| r.value().clone())
        .ok_or_else(|| Error::not_found(kind, id))
}

fn list<T: Clone + Selectable>(map: &DashMap<String, T>, selector: &Selector) -> Vec<T> {
    let mut rows: Vec<(String, T)> = map
        .iter()
        .filter(|r| r.value().matches(selector))
        .map(|r| (r.key().clone(), r.value().clone()))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows.into_iter().map(|(_, v)| v).collect()
}

fn delete<T>(map: &DashMap<String, T>, kind: &'static str, id: &str) -> Result<()> {
    map.remove(id)
        .map(|_| ())
        .ok_or_else(|| Error::not_found(kind, id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_app(&self, app: &Application) -> Result<()> {
        insert(&self.apps, "application", &app.id, app)
    }

    async fn update_app(&self, app: &Application) -> Result<()> {
        update(&self.apps, "application", &app.id, app)
    }

    async fn get_app(&self, id: &str) -> Result<Application> {
        get(&self.apps, "application", id)
    }

    async fn list_apps(&self, selector: &Selector) -> Result<Vec<Application>> {
        Ok(list(&self.apps, selector))
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        delete(&self.apps, "application", id)
    }

    async fn insert_unit(&self, unit: &Unit) -> Result<()> {
        insert(&self.units, "unit", &unit.id, unit)
    }

    async fn update_unit(&self, unit: &Unit) -> Result<()> {
        update(&self.units, "unit", &unit.id, unit)
    }

    async fn get_unit(&self, id: &str) -> Result<Unit> {
        get(&self.units, "unit", id)
    }

    async fn list_units(&self, selector: &Selector) -> Result<Vec<Unit>> {
        Ok(list(&self.units, selector))
    }

    async fn delete_unit(&self, id: &str) -> Result<()> {
        delete(&self.units, "unit", id)
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        insert(&self.tasks, "task", &task.id, task)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        update(&self.tasks, "task", &task.id, task)
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        get(&self.tasks, "task", id)
    }

    async fn insert_backup_file(&self, file: &BackupFile) -> Result<()> {
        insert(&self.backup_files, "backup file", &file.id, file)
    }

    async fn update_backup_file(&self, file: &BackupFile) -> Result<()> {
        update(&self.backup_files, "backup file", &file.id, file)
    }

    async fn get_backup_file(&self, id: &str) -> Result<BackupFile> {
        get(&self.backup_files, "backup file", id)
    }

    async fn list_backup_files(&self, selector: &Selector) -> Result<Vec<BackupFile>> {
        Ok(list(&self.backup_files, selector))
    }
}
