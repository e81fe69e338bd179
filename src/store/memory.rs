use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ExecutionStore, PlaybookStore, ProjectStore, check_version};
use crate::errors::{EngineError, EngineResult};
use crate::pipeline::ForgeProject;
use crate::playbook::{Playbook, PlaybookExecution};

#[derive(Default)]
struct Tables {
    playbooks: HashMap<Uuid, Playbook>,
    executions: HashMap<Uuid, PlaybookExecution>,
    projects: HashMap<Uuid, ForgeProject>,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PlaybookStore for MemoryStore {
    async fn save_playbook(&self, playbook: &Playbook) -> EngineResult<()> {
        self.tables().playbooks.insert(playbook.id, playbook.clone());
        Ok(())
    }

    async fn load_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>> {
        Ok(self.tables().playbooks.get(&id).cloned())
    }

    async fn list_playbooks(&self) -> EngineResult<Vec<Playbook>> {
        let mut all: Vec<Playbook> = self.tables().playbooks.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_playbook(&self, id: Uuid) -> EngineResult<bool> {
        Ok(self.tables().playbooks.remove(&id).is_some())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, execution: &PlaybookExecution) -> EngineResult<()> {
        self.tables().executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: Uuid) -> EngineResult<Option<PlaybookExecution>> {
        Ok(self.tables().executions.get(&id).cloned())
    }

    async fn list_executions(&self, playbook_id: Option<Uuid>) -> EngineResult<Vec<PlaybookExecution>> {
        let mut runs: Vec<PlaybookExecution> = self
            .tables()
            .executions
            .values()
            .filter(|e| playbook_id.is_none_or(|id| e.playbook_id == id))
            .cloned()
            .collect();
        runs.sort_by_key(|e| e.started_at);
        Ok(runs)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject> {
        let mut tables = self.tables();
        if tables.projects.contains_key(&project.id) {
            return Err(EngineError::InvalidState(format!(
                "project {} already exists",
                project.id
            )));
        }
        let mut stored = project.clone();
        stored.version = 1;
        tables.projects.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn load_project(&self, id: Uuid) -> EngineResult<Option<ForgeProject>> {
        Ok(self.tables().projects.get(&id).cloned())
    }

    async fn list_projects(&self) -> EngineResult<Vec<ForgeProject>> {
        let mut all: Vec<ForgeProject> = self.tables().projects.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }

    async fn update_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject> {
        let mut tables = self.tables();
        let stored = tables.projects.get(&project.id).ok_or_else(|| EngineError::NotFound {
            kind: "project",
            id: project.id.to_string(),
        })?;
        let next = check_version(stored, project)?;
        tables.projects.insert(next.id, next.clone());
        Ok(next)
    }
}
