//! Multi-provider consensus.
//!
//! The aggregator fans one request out to several provider/model targets
//! concurrently under a shared deadline. It returns as soon as the quorum
//! has answered, or fails once the deadline passes (or every call has
//! finished) without one. Calls still outstanding at that point are dropped.
//!
//! Responses that carry a score (`{"score": 82}` or a bare number) are merged
//! by mean and compared by spread; free-text responses are compared by word
//! overlap and ranked by how central they are to the others.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::ProviderError;
use crate::ledger::{Attribution, Cost};
use crate::playbook::ModelTarget;
use crate::provider::{CompletionRequest, ProviderGateway};
use crate::util::{extract_json_value, number_field};

/// Quorum and deadline for a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusConfig {
    /// Minimum successful responses. `None` means a strict majority.
    pub quorum: Option<usize>,
    pub deadline: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum: None,
            deadline: Duration::from_secs(90),
        }
    }
}

impl ConsensusConfig {
    pub fn with_quorum(mut self, quorum: Option<usize>) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Responses required out of `targets`.
    pub fn required(&self, targets: usize) -> usize {
        let majority = targets / 2 + 1;
        self.quorum.unwrap_or(majority).clamp(1, targets.max(1))
    }
}

/// One provider's successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderVerdict {
    pub provider: String,
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, f64>,
    pub cost: Cost,
    pub duration_ms: u64,
}

/// A target that failed or did not answer in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub provider: String,
    pub model: String,
    pub error: String,
    /// Billed by the provider before it failed.
    #[serde(default)]
    pub cost: Cost,
}

/// Merged view over the providers that answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Successful answers, best first.
    pub verdicts: Vec<ProviderVerdict>,
    pub failures: Vec<TargetFailure>,
    pub quorum: usize,
    /// 1.0 for full agreement, 0.0 for none.
    pub agreement: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_score: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub merged_dimensions: BTreeMap<String, f64>,
    /// Content of the top-ranked answer.
    pub recommendation: String,
    pub total_cost: Cost,
    pub duration_ms: u64,
}

/// Fans requests out through the provider gateway.
#[derive(Clone)]
pub struct ConsensusAggregator {
    gateway: Arc<ProviderGateway>,
    config: ConsensusConfig,
}

impl ConsensusAggregator {
    pub fn new(gateway: Arc<ProviderGateway>, config: ConsensusConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Evaluate `request` against every target concurrently.
    pub async fn evaluate(
        &self,
        request: &CompletionRequest,
        targets: &[ModelTarget],
        attribution: &Attribution,
        quorum: Option<usize>,
    ) -> Result<ConsensusResult, ProviderError> {
        let config = self.config.clone().with_quorum(quorum.or(self.config.quorum));
        let required = config.required(targets.len());
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + config.deadline;

        info!(
            targets = targets.len(),
            quorum = required,
            step = attribution.step_id.as_deref(),
            "consensus fan-out"
        );

        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .map(|target| async move {
                let call_started = Instant::now();
                let (result, billed) = self.gateway.invoke_metered(target, request, attribution).await;
                (target, result, billed, call_started.elapsed())
            })
            .collect();

        let mut verdicts = Vec::new();
        let mut failures = Vec::new();
        let mut budget_error = None;

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        while verdicts.len() < required {
            if verdicts.len() + pending.len() < required {
                break;
            }
            tokio::select! {
                _ = &mut expiry => {
                    warn!(answered = verdicts.len(), quorum = required, "consensus deadline expired");
                    break;
                }
                next = pending.next() => {
                    let Some((target, result, billed, elapsed)) = next else { break };
                    match result {
                        Ok(invocation) => {
                            let (score, dimensions) = parse_score(&invocation.content);
                            verdicts.push(ProviderVerdict {
                                provider: invocation.provider,
                                model: invocation.model,
                                content: invocation.content,
                                score,
                                dimensions,
                                cost: billed,
                                duration_ms: elapsed.as_millis() as u64,
                            });
                        }
                        Err(err) => {
                            warn!(model_target = %target, "consensus target failed: {}", err);
                            failures.push(TargetFailure {
                                provider: target.provider.clone(),
                                model: target.model.clone(),
                                error: err.to_string(),
                                cost: billed,
                            });
                            if matches!(err, ProviderError::BudgetExceeded { .. }) {
                                budget_error = Some(err);
                            }
                        }
                    }
                }
            }
        }

        // Whatever is still running is abandoned here
        let abandoned = pending.len();
        drop(pending);
        if abandoned > 0 {
            let answered: HashSet<(&str, &str)> = verdicts
                .iter()
                .map(|v| (v.provider.as_str(), v.model.as_str()))
                .chain(failures.iter().map(|f| (f.provider.as_str(), f.model.as_str())))
                .collect();
            let unanswered: Vec<TargetFailure> = targets
                .iter()
                .filter(|t| !answered.contains(&(t.provider.as_str(), t.model.as_str())))
                .map(|t| TargetFailure {
                    provider: t.provider.clone(),
                    model: t.model.clone(),
                    error: "cancelled after consensus returned".to_string(),
                    cost: Cost::ZERO,
                })
                .collect();
            failures.extend(unanswered);
        }

        if verdicts.len() < required {
            if let Some(err) = budget_error {
                return Err(err);
            }
            return Err(ProviderError::QuorumNotMet {
                required,
                succeeded: verdicts.len(),
                failures: failures
                    .iter()
                    .map(|f| format!("{}/{}: {}", f.provider, f.model, f.error))
                    .collect(),
            });
        }

        Ok(merge(verdicts, failures, required, started.elapsed()))
    }
}

/// Pull a 0..=100 score and optional dimension scores out of a response.
pub fn parse_score(content: &str) -> (Option<f64>, BTreeMap<String, f64>) {
    if let Ok(bare) = content.trim().parse::<f64>() {
        return (Some(bare.clamp(0.0, 100.0)), BTreeMap::new());
    }
    let Some(value) = extract_json_value(content) else {
        return (None, BTreeMap::new());
    };
    let score = ["score", "overall_score", "overallScore", "overall"]
        .iter()
        .find_map(|key| number_field(&value, key))
        .map(|s| s.clamp(0.0, 100.0));

    let mut dimensions = BTreeMap::new();
    if let Some(dims @ Value::Object(map)) = value.get("dimensions") {
        for key in map.keys() {
            if let Some(v) = number_field(dims, key) {
                dimensions.insert(key.clone(), v.clamp(0.0, 100.0));
            }
        }
    }
    (score, dimensions)
}

fn merge(
    mut verdicts: Vec<ProviderVerdict>,
    failures: Vec<TargetFailure>,
    quorum: usize,
    elapsed: Duration,
) -> ConsensusResult {
    let scores: Vec<f64> = verdicts.iter().filter_map(|v| v.score).collect();
    let merged_score = mean(&scores);

    let mut merged_dimensions = BTreeMap::new();
    let names: HashSet<&String> = verdicts.iter().flat_map(|v| v.dimensions.keys()).collect();
    for name in names {
        let values: Vec<f64> = verdicts
            .iter()
            .filter_map(|v| v.dimensions.get(name).copied())
            .collect();
        if let Some(m) = mean(&values) {
            merged_dimensions.insert(name.clone(), m);
        }
    }

    let agreement = if scores.len() >= 2 {
        score_agreement(&scores)
    } else if verdicts.len() >= 2 {
        let texts: Vec<&str> = verdicts.iter().map(|v| v.content.as_str()).collect();
        text_agreement(&texts)
    } else {
        1.0
    };

    if scores.is_empty() {
        // Most central answer first
        let texts: Vec<String> = verdicts.iter().map(|v| v.content.clone()).collect();
        let centrality: Vec<f64> = (0..texts.len())
            .map(|i| {
                let others: Vec<f64> = (0..texts.len())
                    .filter(|&j| j != i)
                    .map(|j| jaccard(&texts[i], &texts[j]))
                    .collect();
                mean(&others).unwrap_or(1.0)
            })
            .collect();
        let mut order: Vec<usize> = (0..verdicts.len()).collect();
        order.sort_by(|&a, &b| centrality[b].total_cmp(&centrality[a]));
        let mut slots: Vec<Option<ProviderVerdict>> = verdicts.into_iter().map(Some).collect();
        verdicts = order.into_iter().filter_map(|i| slots[i].take()).collect();
    } else {
        verdicts.sort_by(|a, b| {
            b.score
                .unwrap_or(f64::MIN)
                .total_cmp(&a.score.unwrap_or(f64::MIN))
        });
    }

    let recommendation = verdicts.first().map(|v| v.content.clone()).unwrap_or_default();
    let total_cost = verdicts
        .iter()
        .map(|v| v.cost)
        .chain(failures.iter().map(|f| f.cost))
        .sum();

    ConsensusResult {
        verdicts,
        failures,
        quorum,
        agreement,
        merged_score,
        merged_dimensions,
        recommendation,
        total_cost,
        duration_ms: elapsed.as_millis() as u64,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 1 minus the standard deviation normalized by its maximum (50 on 0..=100).
pub fn score_agreement(scores: &[f64]) -> f64 {
    let Some(m) = mean(scores) else {
        return 1.0;
    };
    let variance = scores.iter().map(|s| (s - m).powi(2)).sum::<f64>() / scores.len() as f64;
    (1.0 - variance.sqrt() / 50.0).clamp(0.0, 1.0)
}

/// Mean pairwise word-set similarity.
pub fn text_agreement(texts: &[&str]) -> f64 {
    let mut pairs = Vec::new();
    for i in 0..texts.len() {
        for j in (i + 1)..texts.len() {
            pairs.push(jaccard(texts[i], texts[j]));
        }
    }
    mean(&pairs).unwrap_or(1.0)
}

fn jaccard(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    };
    let (a, b) = (words(a), words(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CostLedger, TokenUsage};
    use crate::provider::RetryPolicy;
    use crate::provider::fake::{Script, ScriptedProvider};

    fn aggregator(providers: Vec<Arc<ScriptedProvider>>, config: ConsensusConfig) -> ConsensusAggregator {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(300),
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let mut gateway = ProviderGateway::new(Arc::new(CostLedger::new()), policy);
        for provider in providers {
            gateway = gateway.with_provider(provider);
        }
        ConsensusAggregator::new(Arc::new(gateway), config)
    }

    fn targets() -> Vec<ModelTarget> {
        vec![
            ModelTarget::new("p1", "m"),
            ModelTarget::new("p2", "m"),
            ModelTarget::new("p3", "m"),
        ]
    }

    #[test]
    fn test_quorum_defaults_to_majority() {
        let config = ConsensusConfig::default();
        assert_eq!(config.required(3), 2);
        assert_eq!(config.required(4), 3);
        assert_eq!(config.required(1), 1);
        assert_eq!(config.clone().with_quorum(Some(9)).required(3), 3);
        assert_eq!(config.with_quorum(Some(0)).required(3), 1);
    }

    #[test]
    fn test_parse_score_forms() {
        assert_eq!(parse_score("85").0, Some(85.0));
        let (score, dims) = parse_score(
            "Here you go:\n```json\n{\"score\": 72, \"dimensions\": {\"clarity\": 80, \"depth\": \"64\"}}\n```",
        );
        assert_eq!(score, Some(72.0));
        assert_eq!(dims["clarity"], 80.0);
        assert_eq!(dims["depth"], 64.0);
        assert_eq!(parse_score("no numbers here").0, None);
        assert_eq!(parse_score("{\"score\": 140}").0, Some(100.0));
    }

    #[test]
    fn test_agreement_metrics() {
        assert_eq!(score_agreement(&[80.0, 80.0, 80.0]), 1.0);
        assert!(score_agreement(&[0.0, 100.0]) < 0.01);
        assert!(score_agreement(&[70.0, 80.0]) > 0.85);
        assert_eq!(text_agreement(&["the same words", "The same, words"]), 1.0);
        assert_eq!(text_agreement(&["alpha", "beta"]), 0.0);
    }

    #[tokio::test]
    async fn test_slow_provider_excluded_with_quorum_two() {
        let p1 = Arc::new(ScriptedProvider::new("p1", "{\"score\": 80}"));
        let p2 = Arc::new(
            ScriptedProvider::new("p2", "{\"score\": 10}")
                .then(Script::Delay(Duration::from_secs(10), "{\"score\": 10}".into())),
        );
        let p3 = Arc::new(ScriptedProvider::new("p3", "{\"score\": 90}"));
        let agg = aggregator(
            vec![p1, p2, p3],
            ConsensusConfig::default()
                .with_quorum(Some(2))
                .with_deadline(Duration::from_secs(2)),
        );

        let started = Instant::now();
        let result = agg
            .evaluate(&CompletionRequest::new("m", "rate this"), &targets(), &Attribution::default(), None)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.verdicts.len(), 2);
        let providers: HashSet<&str> = result.verdicts.iter().map(|v| v.provider.as_str()).collect();
        assert_eq!(providers, HashSet::from(["p1", "p3"]));
        assert_eq!(result.merged_score, Some(85.0));
        assert_eq!(result.verdicts[0].provider, "p3");
        assert_eq!(result.recommendation, "{\"score\": 90}");
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].provider, "p2");
    }

    #[tokio::test]
    async fn test_total_cost_includes_billed_failures() {
        let answer = |name: &str| {
            Arc::new(
                ScriptedProvider::new(name, "{\"score\": 70}")
                    .then(Script::Delay(Duration::from_millis(50), "{\"score\": 70}".into())),
            )
        };
        let billed_failure = Arc::new(ScriptedProvider::new("p2", "x").then(Script::Fail(
            ProviderError::BadRequest {
                provider: "p2".into(),
                message: "context too long".into(),
            },
            Some(TokenUsage::new(100, 100)),
        )));
        let ledger = Arc::new(CostLedger::new());
        let policy = RetryPolicy {
            timeout: Duration::from_millis(300),
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let gateway = ProviderGateway::new(ledger.clone(), policy)
            .with_provider(answer("p1"))
            .with_provider(billed_failure)
            .with_provider(answer("p3"));
        let agg = ConsensusAggregator::new(Arc::new(gateway), ConsensusConfig::default());
        let run = uuid::Uuid::new_v4();

        let result = agg
            .evaluate(&CompletionRequest::new("m", "rate this"), &targets(), &Attribution::for_run(run), None)
            .await
            .unwrap();

        assert_eq!(result.verdicts.len(), 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].cost, Cost::from_micros(300));
        assert_eq!(result.total_cost, Cost::from_micros(900));
        assert_eq!(result.total_cost, ledger.run_total(run));
    }

    #[tokio::test]
    async fn test_quorum_failure() {
        let failing = |name: &str| {
            Arc::new(ScriptedProvider::new(name, "x").then(Script::Fail(
                ProviderError::BadRequest {
                    provider: name.into(),
                    message: "nope".into(),
                },
                None,
            )))
        };
        let agg = aggregator(
            vec![
                Arc::new(ScriptedProvider::new("p1", "ok")),
                failing("p2"),
                failing("p3"),
            ],
            ConsensusConfig::default(),
        );
        let err = agg
            .evaluate(&CompletionRequest::new("m", "q"), &targets(), &Attribution::default(), None)
            .await
            .unwrap_err();
        match err {
            ProviderError::QuorumNotMet { required, succeeded, failures } => {
                assert_eq!(required, 2);
                assert!(succeeded <= 1);
                assert!(failures.len() >= 2);
            }
            other => panic!("Expected QuorumNotMet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_expiry_fails_without_quorum() {
        let slow = |name: &str| {
            Arc::new(
                ScriptedProvider::new(name, "late")
                    .then(Script::Delay(Duration::from_secs(10), "late".into())),
            )
        };
        let agg = aggregator(
            vec![Arc::new(ScriptedProvider::new("p1", "fast")), slow("p2"), slow("p3")],
            ConsensusConfig::default().with_deadline(Duration::from_millis(100)),
        );
        let err = agg
            .evaluate(&CompletionRequest::new("m", "q"), &targets(), &Attribution::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::QuorumNotMet { succeeded: 1, .. }));
    }

    #[tokio::test]
    async fn test_free_text_ranked_by_centrality() {
        let agg = aggregator(
            vec![
                Arc::new(ScriptedProvider::new("p1", "use a queue with retries")),
                Arc::new(ScriptedProvider::new("p2", "use a queue with backoff retries")),
                Arc::new(ScriptedProvider::new("p3", "rewrite everything in assembly")),
            ],
            ConsensusConfig::default().with_quorum(Some(3)),
        );
        let result = agg
            .evaluate(&CompletionRequest::new("m", "q"), &targets(), &Attribution::default(), None)
            .await
            .unwrap();
        assert_eq!(result.verdicts.len(), 3);
        assert!(result.merged_score.is_none());
        assert_ne!(result.verdicts[0].provider, "p3");
        assert!(result.agreement > 0.0 && result.agreement < 1.0);
    }
}
