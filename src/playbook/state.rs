//! Execution records for playbook runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::model::{Playbook, StepId};
use crate::errors::{EngineError, ErrorKind};
use crate::ledger::Cost;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Check if the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running execution waiting on a `human_input` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub step_id: StepId,
    pub prompt: String,
    pub since: DateTime<Utc>,
    /// The run is cancelled if no input arrives before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Suspension {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// A failure scoped to one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step_id: StepId,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One instantiation of a playbook against specific inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookExecution {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub playbook_name: String,
    pub playbook_version: u32,
    /// SHA-256 of the step set this run executes.
    pub playbook_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    pub results: BTreeMap<StepId, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub skipped: BTreeSet<StepId>,
    pub errors: Vec<StepError>,
    pub total_cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<Cost>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub estimated_step_costs: BTreeMap<StepId, Cost>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PlaybookExecution {
    /// Create a running execution for a snapshot of `playbook`.
    pub fn new(playbook: &Playbook, inputs: Map<String, Value>, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            playbook_id: playbook.id,
            playbook_name: playbook.name.clone(),
            playbook_version: playbook.version,
            playbook_digest: playbook.digest(),
            owner: None,
            project_id: None,
            stage: None,
            status: ExecutionStatus::Running,
            suspension: None,
            inputs,
            dry_run,
            results: BTreeMap::new(),
            skipped: BTreeSet::new(),
            errors: Vec::new(),
            total_cost: Cost::ZERO,
            estimated_cost: None,
            estimated_step_costs: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.status == ExecutionStatus::Running && self.suspension.is_some()
    }

    /// Record a step's output. Existing results are never replaced.
    ///
    /// Returns `false` if the step already has a result.
    pub fn record_result(&mut self, step_id: &str, output: Value) -> bool {
        if self.results.contains_key(step_id) {
            return false;
        }
        self.results.insert(step_id.to_string(), output);
        true
    }

    pub fn record_skip(&mut self, step_id: &str) {
        if !self.results.contains_key(step_id) {
            self.skipped.insert(step_id.to_string());
        }
    }

    pub fn record_error(&mut self, step_id: &str, err: &EngineError) {
        self.errors.push(StepError {
            step_id: step_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        });
    }

    /// Raise the running cost. Never lowers it.
    pub fn raise_cost(&mut self, total: Cost) {
        if total > self.total_cost {
            self.total_cost = total;
        }
    }

    /// Move to a terminal status. Has no effect on an already terminal run.
    pub fn finish(&mut self, status: ExecutionStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.suspension = None;
        self.finished_at = Some(Utc::now());
    }

    /// Whether a step has reached a terminal outcome in this run.
    pub fn is_settled(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id) || self.skipped.contains(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{PromptConfig, Step, StepKind};
    use serde_json::json;

    fn execution() -> PlaybookExecution {
        let playbook = Playbook::new(
            "p",
            vec![Step::new("A", 1, StepKind::Prompt(PromptConfig { template: "x".into() }))],
        );
        PlaybookExecution::new(&playbook, Map::new(), false)
    }

    #[test]
    fn test_results_are_append_only() {
        let mut exec = execution();
        assert!(exec.record_result("A", json!("first")));
        assert!(!exec.record_result("A", json!("second")));
        assert_eq!(exec.results["A"], json!("first"));
    }

    #[test]
    fn test_cost_never_decreases() {
        let mut exec = execution();
        exec.raise_cost(Cost::from_micros(500));
        exec.raise_cost(Cost::from_micros(100));
        assert_eq!(exec.total_cost, Cost::from_micros(500));
    }

    #[test]
    fn test_finish_is_terminal_once() {
        let mut exec = execution();
        exec.suspension = Some(Suspension {
            step_id: "C".into(),
            prompt: "?".into(),
            since: Utc::now(),
            deadline: None,
        });
        assert!(exec.is_suspended());
        exec.finish(ExecutionStatus::Cancelled);
        exec.finish(ExecutionStatus::Completed);
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.suspension.is_none());
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn test_suspension_expiry() {
        let now = Utc::now();
        let open = Suspension {
            step_id: "C".into(),
            prompt: "?".into(),
            since: now,
            deadline: None,
        };
        assert!(!open.is_expired(now + chrono::Duration::days(365)));
        let bounded = Suspension {
            deadline: Some(now + chrono::Duration::seconds(5)),
            ..open
        };
        assert!(!bounded.is_expired(now));
        assert!(bounded.is_expired(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_round_trip_preserves_run_state() {
        let mut exec = execution();
        exec.record_result("A", json!({"content": "hello", "n": 3}));
        exec.record_result("B", json!("text"));
        exec.record_skip("X");
        exec.record_error(
            "C",
            &EngineError::StepExecution {
                step: "C".into(),
                message: "boom".into(),
            },
        );
        exec.raise_cost(Cost::from_micros(1_234_567));
        exec.finish(ExecutionStatus::Failed);

        let text = serde_json::to_string(&exec).unwrap();
        let back: PlaybookExecution = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, exec.status);
        assert_eq!(back.results, exec.results);
        assert_eq!(back.errors, exec.errors);
        assert_eq!(back.total_cost, exec.total_cost);
        assert_eq!(back, exec);
    }
}
