//! `condition` steps: evaluate an expression and pick exactly one branch.

use async_trait::async_trait;
use serde_json::json;

use super::{StepContext, StepExecutor, StepOutcome, StepOutput, step_error};
use crate::errors::EngineResult;
use crate::playbook::{ConditionConfig, Expr};

pub struct ConditionExecutor;

/// Branch recorded in a condition step's output.
pub const BRANCH_FIELD: &str = "branch";

#[async_trait]
impl StepExecutor for ConditionExecutor {
    type Config = ConditionConfig;

    async fn execute(
        &self,
        step_id: &str,
        config: &ConditionConfig,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome> {
        let expr = Expr::parse(&config.expression)
            .map_err(|e| step_error(step_id, format!("invalid expression: {}", e)))?;
        let result = expr.eval(ctx.values);
        let branch = if result { &config.if_true } else { &config.if_false };
        tracing::debug!(step = step_id, result, branch = %branch, "condition evaluated");
        Ok(StepOutcome::Completed(StepOutput::free(json!({
            "result": result,
            BRANCH_FIELD: branch,
        }))))
    }
}
