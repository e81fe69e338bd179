//! `llm_call` steps: one provider through the gateway, or several through
//! the consensus aggregator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{StepContext, StepExecutor, StepOutcome, StepOutput, step_error};
use crate::consensus::ConsensusAggregator;
use crate::errors::{EngineError, EngineResult};
use crate::ledger::Cost;
use crate::playbook::LlmCallConfig;
use crate::playbook::template;
use crate::provider::{CompletionRequest, ProviderGateway};

pub struct LlmCallExecutor {
    gateway: Arc<ProviderGateway>,
    consensus: ConsensusAggregator,
}

impl LlmCallExecutor {
    pub fn new(gateway: Arc<ProviderGateway>, consensus: ConsensusAggregator) -> Self {
        Self { gateway, consensus }
    }

    fn request(step_id: &str, config: &LlmCallConfig, ctx: &StepContext<'_>) -> EngineResult<CompletionRequest> {
        let unresolved = |missing: Vec<String>| {
            step_error(
                step_id,
                format!("unresolved template variables: {}", missing.join(", ")),
            )
        };
        let prompt = template::render(&config.prompt, ctx.values).map_err(unresolved)?;
        let system = match &config.system {
            Some(system) => Some(template::render(system, ctx.values).map_err(unresolved)?),
            None => None,
        };
        let mut request = CompletionRequest::new(&config.model, prompt).with_system(system);
        request.max_tokens = config.max_tokens;
        request.temperature = config.temperature;
        Ok(request)
    }
}

#[async_trait]
impl StepExecutor for LlmCallExecutor {
    type Config = LlmCallConfig;

    async fn execute(
        &self,
        step_id: &str,
        config: &LlmCallConfig,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome> {
        let request = Self::request(step_id, config, ctx)?;
        let targets = config.targets();
        let attribution = ctx.attribution.with_step(step_id);

        if targets.len() > 1 {
            let result = self
                .consensus
                .evaluate(&request, &targets, &attribution, config.quorum)
                .await
                .map_err(|e| EngineError::from_provider(step_id, e))?;
            let cost = result.total_cost;
            return Ok(StepOutcome::Completed(StepOutput {
                output: json!({
                    "content": result.recommendation,
                    "score": result.merged_score,
                    "agreement": result.agreement,
                    "consensus": result,
                }),
                cost,
            }));
        }

        let target = targets
            .first()
            .ok_or_else(|| step_error(step_id, "llm_call needs a provider and model"))?;
        let invocation = self
            .gateway
            .invoke(target, &request, &attribution)
            .await
            .map_err(|e| EngineError::from_provider(step_id, e))?;

        Ok(StepOutcome::Completed(StepOutput {
            output: json!({
                "content": invocation.content,
                "provider": invocation.provider,
                "model": invocation.model,
                "usage": invocation.usage,
                "cost": invocation.cost,
                "duration_ms": invocation.duration_ms,
            }),
            cost: invocation.cost,
        }))
    }

    fn estimate(&self, config: &LlmCallConfig, ctx: &StepContext<'_>) -> Cost {
        // Prior outputs do not exist during estimation; size the raw template instead
        let prompt = template::render(&config.prompt, ctx.values).unwrap_or_else(|_| config.prompt.clone());
        let mut request = CompletionRequest::new(&config.model, prompt).with_system(config.system.clone());
        request.max_tokens = config.max_tokens;
        config
            .targets()
            .iter()
            .map(|target| self.gateway.estimate(target, &request))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusConfig;
    use crate::errors::ProviderError;
    use crate::ledger::{Attribution, CostLedger, TokenUsage};
    use crate::playbook::ModelTarget;
    use crate::provider::RetryPolicy;
    use crate::provider::fake::{Script, ScriptedProvider};
    use serde_json::Value;
    use std::time::Duration;
    use uuid::Uuid;

    fn executor(providers: Vec<Arc<ScriptedProvider>>) -> (LlmCallExecutor, Arc<CostLedger>) {
        let ledger = Arc::new(CostLedger::new());
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let mut gateway = ProviderGateway::new(ledger.clone(), policy);
        for p in providers {
            gateway = gateway.with_provider(p);
        }
        let gateway = Arc::new(gateway);
        let consensus = ConsensusAggregator::new(gateway.clone(), ConsensusConfig::default());
        (LlmCallExecutor::new(gateway, consensus), ledger)
    }

    fn completed(outcome: StepOutcome) -> StepOutput {
        match outcome {
            StepOutcome::Completed(out) => out,
            other => panic!("Expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_provider_call_records_cost() {
        let provider = Arc::new(
            ScriptedProvider::new("openai", "unused")
                .then(Script::Reply("the answer".into(), TokenUsage::new(1000, 500))),
        );
        let (exec, ledger) = executor(vec![provider]);
        let run = Uuid::new_v4();
        let values = json!({"inputs": {"q": "why"}, "steps": {}});
        let ctx = StepContext {
            run_id: run,
            values: &values,
            attribution: Attribution::for_run(run),
        };
        let config = LlmCallConfig::new("openai", "gpt", "Answer: {{q}}");

        let out = completed(exec.execute("B", &config, &ctx).await.unwrap());
        assert_eq!(out.output["content"], "the answer");
        assert_eq!(out.output["usage"]["input_tokens"], 1000);
        // 1000 * $1/M + 500 * $2/M
        assert_eq!(out.cost, Cost::from_micros(2000));
        assert_eq!(ledger.run_summary(run).by_step["B"], out.cost);
    }

    #[tokio::test]
    async fn test_multi_model_call_uses_consensus() {
        let (exec, _) = executor(vec![
            Arc::new(ScriptedProvider::new("a", "{\"score\": 60}")),
            Arc::new(ScriptedProvider::new("b", "{\"score\": 80}")),
        ]);
        let values = json!({"inputs": {}, "steps": {}});
        let ctx = StepContext {
            run_id: Uuid::new_v4(),
            values: &values,
            attribution: Attribution::default(),
        };
        let mut config = LlmCallConfig::new("a", "m", "Rate this");
        config.models = vec![ModelTarget::new("b", "m")];

        let out = completed(exec.execute("B", &config, &ctx).await.unwrap());
        assert_eq!(out.output["score"], 70.0);
        assert_eq!(out.output["content"], "{\"score\": 80}");
        assert!(matches!(out.output["consensus"]["verdicts"], Value::Array(ref v) if v.len() == 2));
    }

    #[tokio::test]
    async fn test_provider_failure_is_step_error() {
        let provider = Arc::new(ScriptedProvider::new("openai", "x").then(Script::Fail(
            ProviderError::Auth {
                provider: "openai".into(),
                message: "invalid key".into(),
            },
            None,
        )));
        let (exec, _) = executor(vec![provider]);
        let values = json!({"inputs": {}, "steps": {}});
        let ctx = StepContext {
            run_id: Uuid::new_v4(),
            values: &values,
            attribution: Attribution::default(),
        };
        let err = exec
            .execute("B", &LlmCallConfig::new("openai", "gpt", "hi"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepExecution { ref step, .. } if step == "B"));
    }

    #[test]
    fn test_estimate_uses_pricing() {
        let (exec, _) = executor(vec![Arc::new(ScriptedProvider::new("openai", "x"))]);
        let values = json!({"inputs": {}, "steps": {}});
        let ctx = StepContext {
            run_id: Uuid::new_v4(),
            values: &values,
            attribution: Attribution::default(),
        };
        let mut config = LlmCallConfig::new("openai", "gpt", "abcdefgh");
        config.max_tokens = Some(1000);
        // 2 input tokens at $1/M + 1000 output tokens at $2/M
        assert_eq!(exec.estimate(&config, &ctx), Cost::from_micros(2002));
    }
}
