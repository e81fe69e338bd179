//! Persistence for playbooks, runs and projects.
//!
//! The engine talks to storage only through these traits. [`MemoryStore`]
//! backs tests and one-shot CLI runs; [`FileStore`] keeps JSON documents
//! under a state directory.

pub mod fs;
pub mod memory;

pub use fs::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::pipeline::ForgeProject;
use crate::playbook::{Playbook, PlaybookExecution};

#[async_trait]
pub trait PlaybookStore: Send + Sync {
    async fn save_playbook(&self, playbook: &Playbook) -> EngineResult<()>;
    async fn load_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>>;
    async fn list_playbooks(&self) -> EngineResult<Vec<Playbook>>;
    /// Returns whether a playbook was removed.
    async fn delete_playbook(&self, id: Uuid) -> EngineResult<bool>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_execution(&self, execution: &PlaybookExecution) -> EngineResult<()>;
    async fn load_execution(&self, id: Uuid) -> EngineResult<Option<PlaybookExecution>>;
    async fn list_executions(&self, playbook_id: Option<Uuid>) -> EngineResult<Vec<PlaybookExecution>>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert a new project at version 1.
    async fn create_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject>;
    async fn load_project(&self, id: Uuid) -> EngineResult<Option<ForgeProject>>;
    async fn list_projects(&self) -> EngineResult<Vec<ForgeProject>>;
    /// Replace a project if the stored version still equals `project.version`.
    ///
    /// Returns the stored copy with its version bumped.
    async fn update_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject>;
}

/// Version check shared by the store implementations.
pub(crate) fn check_version(stored: &ForgeProject, incoming: &ForgeProject) -> EngineResult<ForgeProject> {
    if stored.version != incoming.version {
        return Err(EngineError::ConcurrencyConflict {
            entity: format!("project {}", incoming.id),
            expected: incoming.version,
            found: stored.version,
        });
    }
    let mut next = incoming.clone();
    next.version = stored.version + 1;
    Ok(next)
}
