//! Step executors, one per step variant.
//!
//! Every executor implements [`StepExecutor`] for its own config type. The
//! [`ExecutorRegistry`] dispatches a [`Step`] to the matching executor.
//! `loop` steps are control flow and are driven by the scheduler itself.

pub mod condition;
pub mod llm_call;
pub mod prompt;
pub mod transform;

pub use condition::ConditionExecutor;
pub use llm_call::LlmCallExecutor;
pub use prompt::PromptExecutor;
pub use transform::TransformExecutor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::consensus::ConsensusAggregator;
use crate::errors::{EngineError, EngineResult};
use crate::ledger::{Attribution, Cost};
use crate::playbook::template;
use crate::playbook::{HumanInputConfig, Step, StepKind};
use crate::provider::ProviderGateway;

/// What an executor sees of the run.
pub struct StepContext<'a> {
    pub run_id: Uuid,
    /// `{"inputs": {..}, "steps": {..}, "loop": {..}}`
    pub values: &'a Value,
    pub attribution: Attribution,
}

/// A completed step's output and the cost it incurred.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub output: Value,
    pub cost: Cost,
}

impl StepOutput {
    pub fn free(output: Value) -> Self {
        Self {
            output,
            cost: Cost::ZERO,
        }
    }
}

/// Result of executing a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(StepOutput),
    /// The run must wait for external input.
    Suspend {
        prompt: String,
        timeout: Option<Duration>,
    },
}

/// Executes one step variant.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    type Config: Send + Sync;

    async fn execute(
        &self,
        step_id: &str,
        config: &Self::Config,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome>;

    /// Estimated cost without calling any provider.
    fn estimate(&self, _config: &Self::Config, _ctx: &StepContext<'_>) -> Cost {
        Cost::ZERO
    }
}

/// Yields control back to the caller until `resume` supplies a value.
pub struct HumanInputExecutor;

#[async_trait]
impl StepExecutor for HumanInputExecutor {
    type Config = HumanInputConfig;

    async fn execute(
        &self,
        _step_id: &str,
        config: &HumanInputConfig,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome> {
        let prompt = template::render(&config.prompt, ctx.values).unwrap_or_else(|_| config.prompt.clone());
        Ok(StepOutcome::Suspend {
            prompt,
            timeout: config.timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Dispatches steps to their executors.
pub struct ExecutorRegistry {
    prompt: PromptExecutor,
    llm_call: LlmCallExecutor,
    transform: TransformExecutor,
    condition: ConditionExecutor,
    human_input: HumanInputExecutor,
}

impl ExecutorRegistry {
    pub fn new(gateway: Arc<ProviderGateway>, consensus: ConsensusAggregator) -> Self {
        Self {
            prompt: PromptExecutor,
            llm_call: LlmCallExecutor::new(gateway, consensus),
            transform: TransformExecutor,
            condition: ConditionExecutor,
            human_input: HumanInputExecutor,
        }
    }

    pub async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> EngineResult<StepOutcome> {
        let id = step.id.as_str();
        match &step.kind {
            StepKind::Prompt(config) => self.prompt.execute(id, config, ctx).await,
            StepKind::LlmCall(config) => self.llm_call.execute(id, config, ctx).await,
            StepKind::Transform(config) => self.transform.execute(id, config, ctx).await,
            StepKind::Condition(config) => self.condition.execute(id, config, ctx).await,
            StepKind::HumanInput(config) => self.human_input.execute(id, config, ctx).await,
            StepKind::Loop(_) => Err(EngineError::InvalidState(format!(
                "loop step {} has no standalone executor",
                id
            ))),
        }
    }

    pub fn estimate(&self, step: &Step, ctx: &StepContext<'_>) -> Cost {
        match &step.kind {
            StepKind::Prompt(config) => self.prompt.estimate(config, ctx),
            StepKind::LlmCall(config) => self.llm_call.estimate(config, ctx),
            StepKind::Transform(config) => self.transform.estimate(config, ctx),
            StepKind::Condition(config) => self.condition.estimate(config, ctx),
            StepKind::HumanInput(config) => self.human_input.estimate(config, ctx),
            StepKind::Loop(_) => Cost::ZERO,
        }
    }
}

/// Fail a step with a message.
pub(crate) fn step_error(step_id: &str, message: impl Into<String>) -> EngineError {
    EngineError::StepExecution {
        step: step_id.to_string(),
        message: message.into(),
    }
}
