//! The operations exposed to an API layer.
//!
//! Services resolve entities through the stores, check that the caller may
//! touch them, and delegate to the engine or the stage pipeline. Identity is
//! resolved upstream; a [`Caller`] is taken as given.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::engine::{Engine, ExecutionHandle, RunOptions};
use crate::errors::{EngineError, EngineResult};
use crate::gates::{OverrideRequest, QualityAssessment};
use crate::ledger::Cost;
use crate::pipeline::{AdvanceOutcome, ArtifactExport, ExportFormat, ForgeProject, Stage, StagePipeline};
use crate::playbook::{Playbook, PlaybookExecution, Visibility, validate};
use crate::store::{ExecutionStore, PlaybookStore, ProjectStore};

/// The authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
        }
    }

    fn forbidden(&self, kind: &'static str, id: impl ToString) -> EngineError {
        EngineError::Forbidden {
            user: self.user_id.clone(),
            kind,
            id: id.to_string(),
        }
    }
}

/// Playbook CRUD and execution.
pub struct PlaybookService {
    playbooks: Arc<dyn PlaybookStore>,
    executions: Arc<dyn ExecutionStore>,
    engine: Engine,
}

impl PlaybookService {
    pub fn new(playbooks: Arc<dyn PlaybookStore>, executions: Arc<dyn ExecutionStore>, engine: Engine) -> Self {
        Self {
            playbooks,
            executions,
            engine,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn can_read(caller: &Caller, playbook: &Playbook) -> bool {
        playbook.owner == caller.user_id || playbook.visibility != Visibility::Private
    }

    pub async fn create(&self, caller: &Caller, mut playbook: Playbook) -> EngineResult<Playbook> {
        validate(&playbook)?;
        playbook.owner = caller.user_id.clone();
        playbook.version = 1;
        self.playbooks.save_playbook(&playbook).await?;
        info!(playbook_id = %playbook.id, owner = %caller.user_id, "playbook created");
        Ok(playbook)
    }

    pub async fn get(&self, caller: &Caller, id: Uuid) -> EngineResult<Playbook> {
        let playbook = self
            .playbooks
            .load_playbook(id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "playbook",
                id: id.to_string(),
            })?;
        if !Self::can_read(caller, &playbook) {
            return Err(caller.forbidden("playbook", id));
        }
        Ok(playbook)
    }

    pub async fn list(&self, caller: &Caller) -> EngineResult<Vec<Playbook>> {
        Ok(self
            .playbooks
            .list_playbooks()
            .await?
            .into_iter()
            .filter(|p| Self::can_read(caller, p))
            .collect())
    }

    /// Replace a playbook's definition. Runs already started keep the step
    /// set they snapshotted.
    pub async fn update(&self, caller: &Caller, mut playbook: Playbook) -> EngineResult<Playbook> {
        let stored = self.get(caller, playbook.id).await?;
        if stored.owner != caller.user_id {
            return Err(caller.forbidden("playbook", playbook.id));
        }
        validate(&playbook)?;
        playbook.owner = stored.owner;
        playbook.created_at = stored.created_at;
        playbook.version = stored.version + 1;
        playbook.updated_at = chrono::Utc::now();
        self.playbooks.save_playbook(&playbook).await?;
        info!(playbook_id = %playbook.id, version = playbook.version, "playbook updated");
        Ok(playbook)
    }

    pub async fn delete(&self, caller: &Caller, id: Uuid) -> EngineResult<()> {
        let stored = self.get(caller, id).await?;
        if stored.owner != caller.user_id {
            return Err(caller.forbidden("playbook", id));
        }
        self.playbooks.delete_playbook(id).await?;
        info!(playbook_id = %id, "playbook deleted");
        Ok(())
    }

    /// Run a stored playbook until it finishes or suspends.
    pub async fn execute(
        &self,
        caller: &Caller,
        id: Uuid,
        inputs: Map<String, Value>,
        dry_run: bool,
    ) -> EngineResult<PlaybookExecution> {
        let playbook = self.get(caller, id).await?;
        let options = RunOptions::default()
            .dry_run(dry_run)
            .with_caller(&caller.user_id);
        self.engine.execute(&playbook, inputs, options).await
    }

    /// Start a stored playbook without waiting.
    pub async fn start(
        &self,
        caller: &Caller,
        id: Uuid,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> EngineResult<ExecutionHandle> {
        let playbook = self.get(caller, id).await?;
        self.engine
            .start(&playbook, inputs, options.with_caller(&caller.user_id))
            .await
    }

    pub async fn status(&self, caller: &Caller, handle: ExecutionHandle) -> EngineResult<PlaybookExecution> {
        let execution = self.engine.status(handle).await?;
        self.check_run_owner(caller, &execution)?;
        Ok(execution)
    }

    pub async fn resume(
        &self,
        caller: &Caller,
        handle: ExecutionHandle,
        step_id: &str,
        value: Value,
    ) -> EngineResult<()> {
        self.status(caller, handle).await?;
        self.engine.resume(handle, step_id, value).await
    }

    pub async fn cancel(&self, caller: &Caller, handle: ExecutionHandle) -> EngineResult<()> {
        self.status(caller, handle).await?;
        self.engine.cancel(handle).await
    }

    /// Past runs of a playbook the caller can read.
    pub async fn executions(&self, caller: &Caller, playbook_id: Uuid) -> EngineResult<Vec<PlaybookExecution>> {
        self.get(caller, playbook_id).await?;
        Ok(self
            .executions
            .list_executions(Some(playbook_id))
            .await?
            .into_iter()
            .filter(|e| e.owner.as_deref() == Some(caller.user_id.as_str()))
            .collect())
    }

    fn check_run_owner(&self, caller: &Caller, execution: &PlaybookExecution) -> EngineResult<()> {
        match &execution.owner {
            Some(owner) if owner != &caller.user_id => Err(caller.forbidden("execution", execution.id)),
            _ => Ok(()),
        }
    }
}

/// Forge project operations.
pub struct ForgeService {
    projects: Arc<dyn ProjectStore>,
    pipeline: StagePipeline,
}

impl ForgeService {
    pub fn new(projects: Arc<dyn ProjectStore>, pipeline: StagePipeline) -> Self {
        Self { projects, pipeline }
    }

    pub async fn create_project(
        &self,
        caller: &Caller,
        name: &str,
        idea: &str,
        budget_cap: Option<Cost>,
    ) -> EngineResult<ForgeProject> {
        let mut project = ForgeProject::new(name, idea).with_owner(&caller.user_id);
        project.budget_cap = budget_cap;
        let created = self.projects.create_project(&project).await?;
        info!(project_id = %created.id, owner = %caller.user_id, "forge project created");
        Ok(created)
    }

    pub async fn get_project(&self, caller: &Caller, id: Uuid) -> EngineResult<ForgeProject> {
        let project = self
            .projects
            .load_project(id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "project",
                id: id.to_string(),
            })?;
        if project.owner.as_deref() != Some(caller.user_id.as_str()) {
            return Err(caller.forbidden("project", id));
        }
        Ok(project)
    }

    pub async fn list_projects(&self, caller: &Caller) -> EngineResult<Vec<ForgeProject>> {
        Ok(self
            .projects
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| p.owner.as_deref() == Some(caller.user_id.as_str()))
            .collect())
    }

    /// Try to move a project one stage forward and persist the result.
    ///
    /// A blocked gate is a normal outcome; the project is still saved with
    /// its new artifact and assessment. A failed advance saves whatever it
    /// produced before failing, then returns the error.
    pub async fn advance_stage(
        &self,
        caller: &Caller,
        id: Uuid,
        override_request: Option<&OverrideRequest>,
    ) -> EngineResult<AdvanceOutcome> {
        let project = self.get_project(caller, id).await?;
        let loaded = project.clone();
        let outcome = match self
            .pipeline
            .advance(project, override_request, Some(&caller.user_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                if *failure.project != loaded {
                    self.projects.update_project(&failure.project).await?;
                    info!(project_id = %id, cost = %failure.project.total_cost, "partial stage progress saved");
                }
                return Err(failure.error);
            }
        };
        let saved = self.projects.update_project(outcome.project()).await?;
        Ok(match outcome {
            AdvanceOutcome::Advanced {
                assessment,
                overridden,
                ..
            } => AdvanceOutcome::Advanced {
                project: saved,
                assessment,
                overridden,
            },
            AdvanceOutcome::Completed {
                assessment,
                overridden,
                ..
            } => AdvanceOutcome::Completed {
                project: saved,
                assessment,
                overridden,
            },
            AdvanceOutcome::Blocked { assessment, .. } => AdvanceOutcome::Blocked {
                project: saved,
                assessment,
            },
        })
    }

    /// Score a stage's artifact afresh.
    pub async fn quality_assessment(
        &self,
        caller: &Caller,
        id: Uuid,
        stage: Stage,
    ) -> EngineResult<QualityAssessment> {
        let project = self.get_project(caller, id).await?;
        self.pipeline.assess(&project, stage).await
    }

    pub async fn export_artifact(&self, caller: &Caller, id: Uuid, format: ExportFormat) -> EngineResult<ArtifactExport> {
        Ok(self.get_project(caller, id).await?.export(format))
    }

    pub async fn hold(&self, caller: &Caller, id: Uuid) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, ForgeProject::hold).await
    }

    pub async fn reactivate(&self, caller: &Caller, id: Uuid) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, ForgeProject::reactivate).await
    }

    pub async fn archive(&self, caller: &Caller, id: Uuid) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, ForgeProject::archive).await
    }

    pub async fn cancel(&self, caller: &Caller, id: Uuid) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, ForgeProject::cancel).await
    }

    pub async fn rework(&self, caller: &Caller, id: Uuid, stage: Stage) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, |p| p.rework(stage)).await
    }

    pub async fn submit_revision(&self, caller: &Caller, id: Uuid, content: &str) -> EngineResult<ForgeProject> {
        self.mutate(caller, id, |p| p.submit_revision(content)).await
    }

    async fn mutate<F>(&self, caller: &Caller, id: Uuid, f: F) -> EngineResult<ForgeProject>
    where
        F: FnOnce(&mut ForgeProject) -> EngineResult<()>,
    {
        let mut project = self.get_project(caller, id).await?;
        f(&mut project)?;
        self.projects.update_project(&project).await
    }
}
