//! `prompt` steps: render a template against the run context.

use async_trait::async_trait;
use serde_json::Value;

use super::{StepContext, StepExecutor, StepOutcome, StepOutput, step_error};
use crate::errors::EngineResult;
use crate::playbook::PromptConfig;
use crate::playbook::template;

pub struct PromptExecutor;

#[async_trait]
impl StepExecutor for PromptExecutor {
    type Config = PromptConfig;

    async fn execute(
        &self,
        step_id: &str,
        config: &PromptConfig,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome> {
        let rendered = template::render(&config.template, ctx.values).map_err(|missing| {
            step_error(
                step_id,
                format!("unresolved template variables: {}", missing.join(", ")),
            )
        })?;
        Ok(StepOutcome::Completed(StepOutput::free(Value::String(rendered))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::ledger::{Attribution, Cost};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(values: &Value) -> StepContext<'_> {
        StepContext {
            run_id: Uuid::new_v4(),
            values,
            attribution: Attribution::default(),
        }
    }

    #[tokio::test]
    async fn test_renders_inputs() {
        let values = json!({"inputs": {"topic": "caching"}, "steps": {}});
        let config = PromptConfig {
            template: "Explain {{topic}}".into(),
        };
        let outcome = PromptExecutor.execute("A", &config, &ctx(&values)).await.unwrap();
        match outcome {
            StepOutcome::Completed(out) => {
                assert_eq!(out.output, json!("Explain caching"));
                assert_eq!(out.cost, Cost::ZERO);
            }
            other => panic!("Expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolved_variable_fails() {
        let values = json!({"inputs": {}, "steps": {}});
        let config = PromptConfig {
            template: "Explain {{topic}}".into(),
        };
        let err = PromptExecutor.execute("A", &config, &ctx(&values)).await.unwrap_err();
        match err {
            EngineError::StepExecution { step, message } => {
                assert_eq!(step, "A");
                assert!(message.contains("topic"));
            }
            other => panic!("Expected StepExecution, got {:?}", other),
        }
    }
}
