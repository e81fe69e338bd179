use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;
use crate::errors::{EngineError, EngineResult};
use crate::gates::{GateOverride, QualityAssessment};
use crate::ledger::Cost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Draft,
    Active,
    OnHold,
    Completed,
    Archived,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Archived => "archived",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    /// Only draft and active projects can advance.
    pub fn can_advance(&self) -> bool {
        matches!(self, ProjectStatus::Draft | ProjectStatus::Active)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The generated output of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageArtifact {
    pub stage: Stage,
    pub content: String,
    /// Run that generated the content; `None` for submitted revisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub cost: Cost,
    pub generated_at: DateTime<Utc>,
    /// Latest assessment of exactly this content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<QualityAssessment>,
}

/// A project moving through the Forge stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeProject {
    pub id: Uuid,
    pub name: String,
    /// The raw idea the first stage refines.
    pub idea: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub current_stage: Stage,
    pub status: ProjectStatus,
    pub progress_percentage: f64,
    #[serde(default)]
    pub artifacts: BTreeMap<Stage, StageArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<GateOverride>,
    pub total_cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_cap: Option<Cost>,
    /// Bumped by the store on every successful update.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForgeProject {
    pub fn new(name: &str, idea: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            idea: idea.to_string(),
            owner: None,
            current_stage: Stage::IdeaRefinement,
            status: ProjectStatus::Draft,
            progress_percentage: 0.0,
            artifacts: BTreeMap::new(),
            overrides: Vec::new(),
            total_cost: Cost::ZERO,
            budget_cap: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn with_budget(mut self, cap: Cost) -> Self {
        self.budget_cap = Some(cap);
        self
    }

    pub fn artifact(&self, stage: Stage) -> Option<&StageArtifact> {
        self.artifacts.get(&stage)
    }

    /// Stages whose gate has been passed or overridden.
    pub fn passed_stages(&self) -> usize {
        if self.status == ProjectStatus::Completed {
            Stage::ALL.len()
        } else {
            self.current_stage.index()
        }
    }

    pub(crate) fn refresh_progress(&mut self) {
        self.progress_percentage = self.passed_stages() as f64 / Stage::ALL.len() as f64 * 100.0;
        self.updated_at = Utc::now();
    }

    pub(crate) fn raise_cost(&mut self, total: Cost) {
        if total > self.total_cost {
            self.total_cost = total;
        }
    }

    fn transition(&mut self, allowed: &[ProjectStatus], to: ProjectStatus) -> EngineResult<()> {
        if !allowed.contains(&self.status) {
            return Err(EngineError::InvalidState(format!(
                "project {} is {} and cannot become {}",
                self.id, self.status, to
            )));
        }
        tracing::info!(project_id = %self.id, from = %self.status, to = %to, "project status changed");
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn activate(&mut self) -> EngineResult<()> {
        match self.status {
            ProjectStatus::Active => Ok(()),
            _ => self.transition(&[ProjectStatus::Draft], ProjectStatus::Active),
        }
    }

    pub fn hold(&mut self) -> EngineResult<()> {
        self.transition(&[ProjectStatus::Draft, ProjectStatus::Active], ProjectStatus::OnHold)
    }

    pub fn reactivate(&mut self) -> EngineResult<()> {
        self.transition(&[ProjectStatus::OnHold], ProjectStatus::Active)
    }

    pub fn archive(&mut self) -> EngineResult<()> {
        self.transition(
            &[
                ProjectStatus::Draft,
                ProjectStatus::Active,
                ProjectStatus::OnHold,
                ProjectStatus::Completed,
                ProjectStatus::Cancelled,
            ],
            ProjectStatus::Archived,
        )
    }

    pub fn cancel(&mut self) -> EngineResult<()> {
        self.transition(
            &[ProjectStatus::Draft, ProjectStatus::Active, ProjectStatus::OnHold],
            ProjectStatus::Cancelled,
        )
    }

    /// Discard the current stage's artifact so the next advance regenerates it.
    ///
    /// Only the current stage can be reworked; earlier stages are settled.
    pub fn rework(&mut self, stage: Stage) -> EngineResult<()> {
        if !self.status.can_advance() {
            return Err(EngineError::InvalidState(format!(
                "project {} is {}",
                self.id, self.status
            )));
        }
        if stage != self.current_stage {
            return Err(EngineError::InvalidState(format!(
                "only the current stage ({}) can be reworked, not {}",
                self.current_stage, stage
            )));
        }
        self.artifacts.remove(&stage);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the current stage's artifact with a revised version.
    pub fn submit_revision(&mut self, content: &str) -> EngineResult<()> {
        if !self.status.can_advance() {
            return Err(EngineError::InvalidState(format!(
                "project {} is {}",
                self.id, self.status
            )));
        }
        self.artifacts.insert(
            self.current_stage,
            StageArtifact {
                stage: self.current_stage,
                content: content.to_string(),
                execution_id: None,
                cost: Cost::ZERO,
                generated_at: Utc::now(),
                assessment: None,
            },
        );
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Artifacts of every stage before `stage`, in order.
    pub fn prior_artifacts(&self, stage: Stage) -> Vec<&StageArtifact> {
        Stage::ALL[..stage.index()]
            .iter()
            .filter_map(|s| self.artifacts.get(s))
            .collect()
    }

    /// Structured export of the project's artifacts; rendering to the
    /// requested format happens elsewhere.
    pub fn export(&self, format: ExportFormat) -> ArtifactExport {
        ArtifactExport {
            project_id: self.id,
            name: self.name.clone(),
            format,
            status: self.status,
            current_stage: self.current_stage,
            progress_percentage: self.progress_percentage,
            stages: Stage::ALL
                .iter()
                .filter_map(|stage| self.artifacts.get(stage))
                .map(|artifact| ExportedStage {
                    stage: artifact.stage,
                    title: artifact.stage.title().to_string(),
                    content: artifact.content.clone(),
                    score: artifact.assessment.as_ref().map(|a| a.overall_score),
                    threshold: artifact.assessment.as_ref().map(|a| a.threshold),
                    cost: artifact.cost,
                })
                .collect(),
            overrides: self.overrides.clone(),
            total_cost: self.total_cost,
            exported_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Markdown,
    Pdf,
    Zip,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "pdf" => Ok(ExportFormat::Pdf),
            "zip" => Ok(ExportFormat::Zip),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedStage {
    pub stage: Stage,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub cost: Cost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactExport {
    pub project_id: Uuid,
    pub name: String,
    pub format: ExportFormat,
    pub status: ProjectStatus,
    pub current_stage: Stage,
    pub progress_percentage: f64,
    pub stages: Vec<ExportedStage>,
    pub overrides: Vec<GateOverride>,
    pub total_cost: Cost,
    pub exported_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut project = ForgeProject::new("p", "idea");
        project.activate().unwrap();
        project.hold().unwrap();
        assert!(!project.status.can_advance());
        assert!(project.hold().is_err());
        project.reactivate().unwrap();
        project.cancel().unwrap();
        assert!(project.reactivate().is_err());
        project.archive().unwrap();
        assert_eq!(project.status, ProjectStatus::Archived);
        assert!(project.archive().is_err());
    }

    #[test]
    fn test_rework_only_current_stage() {
        let mut project = ForgeProject::new("p", "idea");
        project.submit_revision("draft one").unwrap();
        assert!(project.rework(Stage::PrdGeneration).is_err());
        project.rework(Stage::IdeaRefinement).unwrap();
        assert!(project.artifact(Stage::IdeaRefinement).is_none());
    }

    #[test]
    fn test_progress_counts_passed_stages() {
        let mut project = ForgeProject::new("p", "idea");
        project.current_stage = Stage::UxRequirements;
        project.refresh_progress();
        assert_eq!(project.progress_percentage, 40.0);
        project.status = ProjectStatus::Completed;
        project.refresh_progress();
        assert_eq!(project.progress_percentage, 100.0);
    }

    #[test]
    fn test_export_lists_stages_in_order() {
        let mut project = ForgeProject::new("p", "idea");
        project.submit_revision("refined").unwrap();
        project.current_stage = Stage::PrdGeneration;
        project.submit_revision("prd").unwrap();

        let export = project.export("md".parse().unwrap());
        assert_eq!(export.format, ExportFormat::Markdown);
        let stages: Vec<Stage> = export.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![Stage::IdeaRefinement, Stage::PrdGeneration]);
        assert_eq!(export.stages[1].title, "Product Requirements");
    }

    #[test]
    fn test_project_round_trips() {
        let mut project = ForgeProject::new("p", "idea").with_budget(Cost::from_dollars(5.0));
        project.submit_revision("text").unwrap();
        let json = serde_json::to_string(&project).unwrap();
        let back: ForgeProject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, project);
    }
}
