//! Playbook definitions, graph validation and run records.

pub mod expr;
pub mod graph;
pub mod model;
pub mod state;
pub mod template;

pub use expr::Expr;
pub use graph::{StepGraph, StepGraphBuilder, StepIndex};
pub use model::{
    ConditionConfig, HumanInputConfig, LlmCallConfig, LoopConfig, ModelTarget, Playbook,
    PromptConfig, Step, StepId, StepKind, StepType, TransformConfig, TransformOp, Visibility,
};
pub use state::{ExecutionStatus, PlaybookExecution, StepError, Suspension};

use crate::errors::ValidationError;

/// Validate a playbook's step graph.
pub fn validate(playbook: &Playbook) -> Result<StepGraph, ValidationError> {
    StepGraphBuilder::new(playbook).build()
}
