//! JSON documents on disk.
//!
//! Layout under the root directory:
//!
//! ```text
//! playbooks/<id>.json
//! executions/<id>.json
//! projects/<id>.json
//! store.lock
//! ```
//!
//! Every access holds an exclusive `fs2` lock on `store.lock`, so separate
//! processes sharing a directory see whole documents and project version
//! checks are atomic. Blocking file I/O runs on tokio's blocking pool.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{ExecutionStore, PlaybookStore, ProjectStore, check_version};
use crate::errors::{EngineError, EngineResult};
use crate::pipeline::ForgeProject;
use crate::playbook::{Playbook, PlaybookExecution};

const PLAYBOOKS: &str = "playbooks";
const EXECUTIONS: &str = "executions";
const PROJECTS: &str = "projects";

#[derive(Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [PLAYBOOKS, EXECUTIONS, PROJECTS] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create {}", root.join(dir).display()))?;
        }
        Ok(Self {
            root: Arc::new(root.to_path_buf()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` on a blocking thread while holding the store lock.
    async fn call<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Path) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = StoreLock::acquire(&root)?;
            f(&root)
        })
        .await
        .map_err(|e| EngineError::Store(format!("store task panicked: {}", e)))?
    }
}

/// Exclusive lock released on drop.
struct StoreLock(File);

impl StoreLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join("store.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self(file))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn document(root: &Path, kind: &str, id: Uuid) -> PathBuf {
    root.join(kind).join(format!("{}.json", id))
}

fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Write through a temporary file so readers never see a partial document.
fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize document")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    paths.sort();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(value) = read(&path)? {
            out.push(value);
        }
    }
    Ok(out)
}

#[async_trait]
impl PlaybookStore for FileStore {
    async fn save_playbook(&self, playbook: &Playbook) -> EngineResult<()> {
        let playbook = playbook.clone();
        self.call(move |root| Ok(write(&document(root, PLAYBOOKS, playbook.id), &playbook)?))
            .await
    }

    async fn load_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>> {
        self.call(move |root| Ok(read(&document(root, PLAYBOOKS, id))?)).await
    }

    async fn list_playbooks(&self) -> EngineResult<Vec<Playbook>> {
        self.call(|root| {
            let mut all: Vec<Playbook> = read_all(&root.join(PLAYBOOKS))?;
            all.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(all)
        })
        .await
    }

    async fn delete_playbook(&self, id: Uuid) -> EngineResult<bool> {
        self.call(move |root| {
            let path = document(root, PLAYBOOKS, id);
            if !path.exists() {
                return Ok(false);
            }
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            Ok(true)
        })
        .await
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn save_execution(&self, execution: &PlaybookExecution) -> EngineResult<()> {
        let execution = execution.clone();
        self.call(move |root| Ok(write(&document(root, EXECUTIONS, execution.id), &execution)?))
            .await
    }

    async fn load_execution(&self, id: Uuid) -> EngineResult<Option<PlaybookExecution>> {
        self.call(move |root| Ok(read(&document(root, EXECUTIONS, id))?)).await
    }

    async fn list_executions(&self, playbook_id: Option<Uuid>) -> EngineResult<Vec<PlaybookExecution>> {
        self.call(move |root| {
            let mut runs: Vec<PlaybookExecution> = read_all(&root.join(EXECUTIONS))?;
            runs.retain(|e| playbook_id.is_none_or(|id| e.playbook_id == id));
            runs.sort_by_key(|e| e.started_at);
            Ok(runs)
        })
        .await
    }
}

#[async_trait]
impl ProjectStore for FileStore {
    async fn create_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject> {
        let mut stored = project.clone();
        self.call(move |root| {
            let path = document(root, PROJECTS, stored.id);
            if path.exists() {
                return Err(EngineError::InvalidState(format!(
                    "project {} already exists",
                    stored.id
                )));
            }
            stored.version = 1;
            write(&path, &stored)?;
            Ok(stored)
        })
        .await
    }

    async fn load_project(&self, id: Uuid) -> EngineResult<Option<ForgeProject>> {
        self.call(move |root| Ok(read(&document(root, PROJECTS, id))?)).await
    }

    async fn list_projects(&self) -> EngineResult<Vec<ForgeProject>> {
        self.call(|root| {
            let mut all: Vec<ForgeProject> = read_all(&root.join(PROJECTS))?;
            all.sort_by_key(|p| p.created_at);
            Ok(all)
        })
        .await
    }

    async fn update_project(&self, project: &ForgeProject) -> EngineResult<ForgeProject> {
        let incoming = project.clone();
        self.call(move |root| {
            let path = document(root, PROJECTS, incoming.id);
            let stored: ForgeProject = read(&path)?.ok_or_else(|| EngineError::NotFound {
                kind: "project",
                id: incoming.id.to_string(),
            })?;
            let next = check_version(&stored, &incoming)?;
            write(&path, &next)?;
            Ok(next)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Cost;
    use crate::playbook::ExecutionStatus;
    use serde_json::{Map, json};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_execution_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let playbook = Playbook::new("p", Vec::new());
        let mut execution = PlaybookExecution::new(&playbook, Map::new(), false);
        execution.record_result("A", json!({"content": "hi"}));
        execution.raise_cost(Cost::from_micros(1234));
        execution.finish(ExecutionStatus::Completed);
        store.save_execution(&execution).await.unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        let loaded = reopened.load_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded, execution);
        assert_eq!(reopened.list_executions(Some(playbook.id)).await.unwrap().len(), 1);
        assert!(reopened.list_executions(Some(Uuid::new_v4())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_versioning_on_disk() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let created = store.create_project(&ForgeProject::new("p", "idea")).await.unwrap();
        assert!(store.create_project(&created).await.is_err());

        let updated = store.update_project(&created).await.unwrap();
        assert_eq!(updated.version, 2);
        let err = store.update_project(&created).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn test_missing_documents() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_playbook(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!store.delete_playbook(Uuid::new_v4()).await.unwrap());
        let missing = ForgeProject::new("p", "idea");
        assert!(matches!(
            store.update_project(&missing).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
