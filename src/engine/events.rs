//! Events emitted while a run progresses.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ledger::Cost;
use crate::playbook::{ExecutionStatus, StepType};

/// Progress of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_type: StepType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        cost: Cost,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    /// The step sits on an untaken branch.
    StepSkipped { run_id: Uuid, step_id: String },
    Suspended {
        run_id: Uuid,
        step_id: String,
        prompt: String,
    },
    Resumed { run_id: Uuid, step_id: String },
    RunFinished {
        run_id: Uuid,
        status: ExecutionStatus,
        total_cost: Cost,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::Suspended { run_id, .. }
            | Self::Resumed { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<RunEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Create an event channel for `RunOptions::with_events`.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let run_id = Uuid::new_v4();
        let event = RunEvent::Suspended {
            run_id,
            step_id: "C".into(),
            prompt: "Approve?".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "suspended");
        assert_eq!(json["step_id"], "C");
        assert_eq!(event.run_id(), run_id);
    }
}
