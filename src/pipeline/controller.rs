//! Drives a project through its stages.
//!
//! `advance` generates the current stage's artifact (unless one is already
//! waiting for review), assesses it, and moves to the next stage only when
//! the gate passes or an override is supplied. A blocked gate leaves the
//! stage where it is and hands the assessment back to the caller.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use tracing::{info, info_span, warn, Instrument};

use super::project::{ForgeProject, ProjectStatus, StageArtifact};
use super::stage::Stage;
use crate::engine::{Engine, RunOptions};
use crate::errors::{EngineError, EngineResult};
use crate::gates::{GateDecision, GateOverride, OverrideRequest, QualityAssessment, QualityGate};
use crate::ledger::{Attribution, Cost};
use crate::playbook::{
    ExecutionStatus, LlmCallConfig, ModelTarget, Playbook, PromptConfig, Step, StepKind,
};

/// Models, thresholds and limits for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_threshold: f64,
    pub thresholds: HashMap<Stage, f64>,
    /// Model that writes every stage's artifact.
    pub generation: ModelTarget,
    /// Extra models consulted for stages generated by consensus.
    pub analysis_models: Vec<ModelTarget>,
    pub max_tokens: Option<u32>,
    /// Cap applied to projects that do not carry their own.
    pub project_cap: Option<Cost>,
}

impl PipelineSettings {
    pub fn new(generation: ModelTarget) -> Self {
        Self {
            default_threshold: 70.0,
            thresholds: HashMap::new(),
            generation,
            analysis_models: Vec::new(),
            max_tokens: None,
            project_cap: None,
        }
    }

    pub fn threshold(&self, stage: Stage) -> f64 {
        self.thresholds
            .get(&stage)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// Result of [`StagePipeline::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Moved to the next stage.
    Advanced {
        project: ForgeProject,
        assessment: QualityAssessment,
        overridden: Option<GateOverride>,
    },
    /// The final gate passed and the project is complete.
    Completed {
        project: ForgeProject,
        assessment: QualityAssessment,
        overridden: Option<GateOverride>,
    },
    /// The gate failed; the stage is unchanged.
    Blocked {
        project: ForgeProject,
        assessment: QualityAssessment,
    },
}

impl AdvanceOutcome {
    pub fn project(&self) -> &ForgeProject {
        match self {
            AdvanceOutcome::Advanced { project, .. }
            | AdvanceOutcome::Completed { project, .. }
            | AdvanceOutcome::Blocked { project, .. } => project,
        }
    }

    pub fn into_project(self) -> ForgeProject {
        match self {
            AdvanceOutcome::Advanced { project, .. }
            | AdvanceOutcome::Completed { project, .. }
            | AdvanceOutcome::Blocked { project, .. } => project,
        }
    }

    pub fn assessment(&self) -> &QualityAssessment {
        match self {
            AdvanceOutcome::Advanced { assessment, .. }
            | AdvanceOutcome::Completed { assessment, .. }
            | AdvanceOutcome::Blocked { assessment, .. } => assessment,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, AdvanceOutcome::Blocked { .. })
    }
}

/// A stage advance that stopped with an error.
///
/// `project` holds the state reached before the failure (activation, a
/// generated artifact, spent cost) so the caller can persist it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AdvanceFailure {
    pub project: Box<ForgeProject>,
    pub error: EngineError,
}

const BRIEF_STEP: &str = "brief";
const DRAFT_STEP: &str = "draft";

pub struct StagePipeline {
    engine: Engine,
    gate: QualityGate,
    settings: PipelineSettings,
}

impl StagePipeline {
    pub fn new(engine: Engine, gate: QualityGate, settings: PipelineSettings) -> Self {
        Self {
            engine,
            gate,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// The playbook that generates `stage`'s artifact for `project`.
    pub fn stage_playbook(&self, stage: Stage) -> Playbook {
        let brief = Step::new(
            BRIEF_STEP,
            1,
            StepKind::Prompt(PromptConfig {
                template: format!(
                    "{}\n\nProject: {{{{inputs.name}}}}\nIdea: {{{{inputs.idea}}}}\n{{{{inputs.context?}}}}",
                    stage.instructions()
                ),
            }),
        );

        let mut call = LlmCallConfig::new(
            &self.settings.generation.provider,
            &self.settings.generation.model,
            &format!("{{{{steps.{}}}}}", BRIEF_STEP),
        );
        call.system = Some(format!(
            "You are writing the {} document of a product planning pipeline.",
            stage.title()
        ));
        call.max_tokens = self.settings.max_tokens;
        if stage.uses_consensus() {
            call.models = self.settings.analysis_models.clone();
        }
        let draft = Step::new(DRAFT_STEP, 2, StepKind::LlmCall(call));

        Playbook::new(&format!("forge-{}", stage.as_str()), vec![brief, draft])
    }

    fn stage_inputs(project: &ForgeProject, stage: Stage) -> Map<String, Value> {
        let context = project
            .prior_artifacts(stage)
            .iter()
            .map(|a| format!("## {}\n\n{}", a.stage.title(), a.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut inputs = Map::new();
        inputs.insert("name".into(), json!(project.name));
        inputs.insert("idea".into(), json!(project.idea));
        inputs.insert("context".into(), json!(context));
        inputs
    }

    fn open_budget(&self, project: &ForgeProject) {
        self.engine.ledger().open_project(
            project.id,
            project.total_cost,
            project.budget_cap.or(self.settings.project_cap),
        );
    }

    /// Run the current stage's generation playbook and store its artifact.
    pub async fn generate(&self, project: &mut ForgeProject, caller: Option<&str>) -> EngineResult<()> {
        let stage = project.current_stage;
        self.open_budget(project);

        let mut options = RunOptions::default().for_project(project.id, stage.as_str());
        if let Some(caller) = caller {
            options = options.with_caller(caller);
        }
        let execution = self
            .engine
            .execute(
                &self.stage_playbook(stage),
                Self::stage_inputs(project, stage),
                options,
            )
            .await;
        project.raise_cost(self.engine.ledger().project_total(project.id));
        let execution = execution?;

        if execution.status != ExecutionStatus::Completed {
            let reason = execution
                .errors
                .last()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("generation run {}", execution.status));
            warn!(project_id = %project.id, stage = %stage, "stage generation failed: {}", reason);
            return Err(match execution.errors.last() {
                Some(e) if e.kind == crate::errors::ErrorKind::BudgetExceeded => {
                    EngineError::BudgetExceeded {
                        scope: format!("project {}", project.id),
                        spent: project.total_cost.as_dollars(),
                        cap: project
                            .budget_cap
                            .or(self.settings.project_cap)
                            .map(Cost::as_dollars)
                            .unwrap_or_default(),
                    }
                }
                _ => EngineError::StepExecution {
                    step: stage.as_str().to_string(),
                    message: reason,
                },
            });
        }

        let content = execution
            .results
            .get(DRAFT_STEP)
            .and_then(|r| r.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if content.trim().is_empty() {
            return Err(EngineError::StepExecution {
                step: stage.as_str().to_string(),
                message: "generation returned no content".to_string(),
            });
        }

        project.artifacts.insert(
            stage,
            StageArtifact {
                stage,
                content,
                execution_id: Some(execution.id),
                cost: execution.total_cost,
                generated_at: chrono::Utc::now(),
                assessment: None,
            },
        );
        info!(project_id = %project.id, stage = %stage, cost = %execution.total_cost, "stage artifact generated");
        Ok(())
    }

    /// Score the stored artifact of `stage`.
    pub async fn assess(&self, project: &ForgeProject, stage: Stage) -> EngineResult<QualityAssessment> {
        let artifact = project.artifact(stage).ok_or_else(|| EngineError::NotFound {
            kind: "artifact",
            id: format!("{}/{}", project.id, stage),
        })?;
        self.open_budget(project);

        let dimensions: Vec<String> = stage.dimensions().iter().map(|d| d.to_string()).collect();
        let attribution = Attribution::for_project(project.id, stage.as_str()).with_caller(project.owner.clone());
        self.gate
            .assess(
                stage.as_str(),
                &artifact.content,
                self.settings.threshold(stage),
                &dimensions,
                &attribution,
            )
            .await
            .map_err(|e| EngineError::from_provider(stage.as_str(), e))
    }

    /// Try to move `project` one stage forward.
    ///
    /// On failure the project comes back inside [`AdvanceFailure`] with
    /// everything the attempt produced before it stopped.
    pub async fn advance(
        &self,
        mut project: ForgeProject,
        override_request: Option<&OverrideRequest>,
        caller: Option<&str>,
    ) -> Result<AdvanceOutcome, AdvanceFailure> {
        let span = info_span!("advance", project_id = %project.id, stage = %project.current_stage);
        let attempt = self
            .try_advance(&mut project, override_request, caller)
            .instrument(span)
            .await;
        match attempt {
            Ok((Transition::Advanced(overridden), assessment)) => Ok(AdvanceOutcome::Advanced {
                project,
                assessment,
                overridden,
            }),
            Ok((Transition::Completed(overridden), assessment)) => Ok(AdvanceOutcome::Completed {
                project,
                assessment,
                overridden,
            }),
            Ok((Transition::Blocked, assessment)) => Ok(AdvanceOutcome::Blocked { project, assessment }),
            Err(error) => {
                warn!(project_id = %project.id, stage = %project.current_stage, cost = %project.total_cost, "stage advance failed: {}", error);
                Err(AdvanceFailure {
                    project: Box::new(project),
                    error,
                })
            }
        }
    }

    async fn try_advance(
        &self,
        project: &mut ForgeProject,
        override_request: Option<&OverrideRequest>,
        caller: Option<&str>,
    ) -> EngineResult<(Transition, QualityAssessment)> {
        if !project.status.can_advance() {
            return Err(EngineError::InvalidState(format!(
                "project {} is {} and cannot advance",
                project.id, project.status
            )));
        }
        project.activate()?;
        let stage = project.current_stage;

        if project.artifact(stage).is_none() {
            self.generate(project, caller).await?;
        }

        let assessment = self.assess(project, stage).await;
        project.raise_cost(self.engine.ledger().project_total(project.id));
        let assessment = assessment?;
        if let Some(artifact) = project.artifacts.get_mut(&stage) {
            artifact.assessment = Some(assessment.clone());
        }

        let overridden = match QualityGate::decide(&assessment, override_request)? {
            GateDecision::Blocked => {
                info!(score = assessment.overall_score, threshold = assessment.threshold, "stage blocked");
                project.refresh_progress();
                return Ok((Transition::Blocked, assessment));
            }
            GateDecision::Passed => None,
            GateDecision::Overridden(audit) => {
                project.overrides.push(audit.clone());
                Some(audit)
            }
        };

        match stage.next() {
            Some(next) => {
                project.current_stage = next;
                project.refresh_progress();
                info!(to = %next, "stage advanced");
                Ok((Transition::Advanced(overridden), assessment))
            }
            None => {
                project.status = ProjectStatus::Completed;
                project.refresh_progress();
                info!("project completed");
                Ok((Transition::Completed(overridden), assessment))
            }
        }
    }
}

enum Transition {
    Advanced(Option<GateOverride>),
    Completed(Option<GateOverride>),
    Blocked,
}
