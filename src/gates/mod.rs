//! Quality gates.
//!
//! A gate scores an artifact and compares the score to a threshold. Falling
//! short is not an error: the caller gets [`GateDecision::Blocked`] and may
//! improve the artifact or override the gate. An override always names who
//! made it and why, and is logged.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::consensus::ConsensusAggregator;
use crate::errors::{EngineError, EngineResult, ProviderError};
use crate::ledger::{Attribution, Cost};
use crate::playbook::ModelTarget;
use crate::provider::CompletionRequest;
use crate::util::extract_json_value;

/// One scorer's view of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider: String,
    pub model: String,
    pub score: f64,
}

/// Scores produced for an artifact, before a threshold is applied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreCard {
    pub overall: f64,
    pub dimensions: BTreeMap<String, f64>,
    pub agreement: Option<f64>,
    pub providers: Vec<ProviderScore>,
    pub feedback: Option<String>,
    pub cost: Cost,
}

/// A scored artifact and the threshold it was held to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub stage: String,
    pub overall_score: f64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_scores: Vec<ProviderScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// SHA-256 of the artifact content that was scored.
    pub artifact_digest: String,
    pub cost: Cost,
    pub assessed_at: DateTime<Utc>,
}

impl QualityAssessment {
    /// Score at or above the threshold.
    pub fn passes(&self) -> bool {
        self.overall_score >= self.threshold
    }

    /// Whether this assessment scored exactly `content`.
    pub fn covers(&self, content: &str) -> bool {
        self.artifact_digest == artifact_digest(content)
    }
}

pub fn artifact_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Audit entry for a gate passed despite a failing score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOverride {
    pub stage: String,
    pub actor: String,
    pub reason: String,
    pub score: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

/// Who is overriding a gate, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub actor: String,
    pub reason: String,
}

impl OverrideRequest {
    pub fn new(actor: &str, reason: &str) -> Self {
        Self {
            actor: actor.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Passed,
    Overridden(GateOverride),
    Blocked,
}

impl GateDecision {
    pub fn permits_advance(&self) -> bool {
        !matches!(self, GateDecision::Blocked)
    }
}

/// Produces scores for an artifact.
#[async_trait]
pub trait ArtifactScorer: Send + Sync {
    async fn score(
        &self,
        stage: &str,
        artifact: &str,
        dimensions: &[String],
        attribution: &Attribution,
    ) -> Result<ScoreCard, ProviderError>;
}

/// Scores artifacts by asking several models and merging their answers.
pub struct ConsensusScorer {
    aggregator: ConsensusAggregator,
    targets: Vec<ModelTarget>,
    quorum: Option<usize>,
}

impl ConsensusScorer {
    pub fn new(aggregator: ConsensusAggregator, targets: Vec<ModelTarget>) -> Self {
        Self {
            aggregator,
            targets,
            quorum: None,
        }
    }

    pub fn with_quorum(mut self, quorum: Option<usize>) -> Self {
        self.quorum = quorum;
        self
    }

    fn prompt(stage: &str, artifact: &str, dimensions: &[String]) -> String {
        let dims = dimensions
            .iter()
            .map(|d| format!("\"{}\": <0-100>", d))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "You are reviewing the output of the {stage} stage of a product planning pipeline.\n\
             Score it from 0 to 100 overall and on each dimension.\n\
             Respond with JSON only, in this shape:\n\
             {{\"overall_score\": <0-100>, \"dimensions\": {{{dims}}}, \"feedback\": \"<one paragraph>\"}}\n\n\
             --- ARTIFACT ---\n{artifact}\n--- END ARTIFACT ---"
        )
    }
}

#[async_trait]
impl ArtifactScorer for ConsensusScorer {
    async fn score(
        &self,
        stage: &str,
        artifact: &str,
        dimensions: &[String],
        attribution: &Attribution,
    ) -> Result<ScoreCard, ProviderError> {
        let model = self.targets.first().map(|t| t.model.as_str()).unwrap_or_default();
        let request = CompletionRequest::new(model, Self::prompt(stage, artifact, dimensions))
            .with_system(Some("You are a strict, fair reviewer. Output JSON only.".to_string()));
        let result = self
            .aggregator
            .evaluate(&request, &self.targets, attribution, self.quorum)
            .await?;

        let overall = result.merged_score.ok_or_else(|| ProviderError::Malformed {
            provider: "consensus".to_string(),
            message: "no scorer returned a numeric score".to_string(),
        })?;
        let feedback = result.verdicts.first().and_then(|v| {
            extract_json_value(&v.content)
                .and_then(|json| json.get("feedback").and_then(Value::as_str).map(String::from))
        });

        Ok(ScoreCard {
            overall,
            dimensions: result.merged_dimensions,
            agreement: Some(result.agreement),
            providers: result
                .verdicts
                .iter()
                .filter_map(|v| {
                    v.score.map(|score| ProviderScore {
                        provider: v.provider.clone(),
                        model: v.model.clone(),
                        score,
                    })
                })
                .collect(),
            feedback,
            cost: result.total_cost,
        })
    }
}

/// Assesses artifacts against stage thresholds.
#[derive(Clone)]
pub struct QualityGate {
    scorer: Arc<dyn ArtifactScorer>,
}

impl QualityGate {
    pub fn new(scorer: Arc<dyn ArtifactScorer>) -> Self {
        Self { scorer }
    }

    pub async fn assess(
        &self,
        stage: &str,
        artifact: &str,
        threshold: f64,
        dimensions: &[String],
        attribution: &Attribution,
    ) -> Result<QualityAssessment, ProviderError> {
        let card = self.scorer.score(stage, artifact, dimensions, attribution).await?;
        let assessment = QualityAssessment {
            stage: stage.to_string(),
            overall_score: card.overall.clamp(0.0, 100.0),
            dimensions: card.dimensions,
            threshold,
            agreement: card.agreement,
            provider_scores: card.providers,
            feedback: card.feedback,
            artifact_digest: artifact_digest(artifact),
            cost: card.cost,
            assessed_at: Utc::now(),
        };
        info!(
            stage,
            score = assessment.overall_score,
            threshold,
            passed = assessment.passes(),
            "quality assessed"
        );
        Ok(assessment)
    }

    pub fn passes(assessment: &QualityAssessment) -> bool {
        assessment.passes()
    }

    /// Decide whether `assessment` lets the stage advance.
    ///
    /// An override is only consulted when the score falls short, and must
    /// carry a non-empty actor and reason.
    pub fn decide(
        assessment: &QualityAssessment,
        override_request: Option<&OverrideRequest>,
    ) -> EngineResult<GateDecision> {
        if assessment.passes() {
            return Ok(GateDecision::Passed);
        }
        match override_request {
            Some(request) => Ok(GateDecision::Overridden(Self::override_gate(
                assessment,
                &request.actor,
                &request.reason,
            )?)),
            None => Ok(GateDecision::Blocked),
        }
    }

    /// Record an explicit override of a failing gate.
    pub fn override_gate(
        assessment: &QualityAssessment,
        actor: &str,
        reason: &str,
    ) -> EngineResult<GateOverride> {
        if actor.trim().is_empty() {
            return Err(EngineError::InvalidState(
                "a gate override must name the actor".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(EngineError::InvalidState(
                "a gate override must give a reason".to_string(),
            ));
        }
        warn!(
            stage = %assessment.stage,
            actor,
            reason,
            score = assessment.overall_score,
            threshold = assessment.threshold,
            "quality gate overridden"
        );
        Ok(GateOverride {
            stage: assessment.stage.clone(),
            actor: actor.trim().to_string(),
            reason: reason.trim().to_string(),
            score: assessment.overall_score,
            threshold: assessment.threshold,
            at: Utc::now(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Returns queued scores in order, then repeats the last one.
    pub struct FixedScorer {
        scores: Mutex<Vec<f64>>,
        last: Mutex<f64>,
    }

    impl FixedScorer {
        pub fn new(scores: &[f64]) -> Self {
            let mut queue = scores.to_vec();
            queue.reverse();
            Self {
                last: Mutex::new(scores.first().copied().unwrap_or(0.0)),
                scores: Mutex::new(queue),
            }
        }
    }

    #[async_trait]
    impl ArtifactScorer for FixedScorer {
        async fn score(
            &self,
            _stage: &str,
            _artifact: &str,
            dimensions: &[String],
            _attribution: &Attribution,
        ) -> Result<ScoreCard, ProviderError> {
            let next = self.scores.lock().unwrap().pop();
            let mut last = self.last.lock().unwrap();
            if let Some(score) = next {
                *last = score;
            }
            Ok(ScoreCard {
                overall: *last,
                dimensions: dimensions.iter().map(|d| (d.clone(), *last)).collect(),
                agreement: Some(1.0),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod flaky {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with an unmet quorum a fixed number of times, then scores.
    pub struct FlakyScorer {
        failures_left: AtomicUsize,
        score: f64,
    }

    impl FlakyScorer {
        pub fn new(failures: usize, score: f64) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                score,
            }
        }
    }

    #[async_trait]
    impl ArtifactScorer for FlakyScorer {
        async fn score(
            &self,
            _stage: &str,
            _artifact: &str,
            dimensions: &[String],
            _attribution: &Attribution,
        ) -> Result<ScoreCard, ProviderError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ProviderError::QuorumNotMet {
                    required: 2,
                    succeeded: 1,
                    failures: vec!["judge-b: timed out".into()],
                });
            }
            Ok(ScoreCard {
                overall: self.score,
                dimensions: dimensions.iter().map(|d| (d.clone(), self.score)).collect(),
                agreement: Some(1.0),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusConfig;
    use crate::ledger::CostLedger;
    use crate::provider::fake::ScriptedProvider;
    use crate::provider::{ProviderGateway, RetryPolicy};

    fn assessment(score: f64, threshold: f64) -> QualityAssessment {
        QualityAssessment {
            stage: "prd_generation".into(),
            overall_score: score,
            dimensions: BTreeMap::new(),
            threshold,
            agreement: None,
            provider_scores: Vec::new(),
            feedback: None,
            artifact_digest: artifact_digest("doc"),
            cost: Cost::ZERO,
            assessed_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(assessment(70.0, 70.0).passes());
        assert!(!assessment(69.99, 70.0).passes());
        assert!(QualityGate::passes(&assessment(90.0, 70.0)));
    }

    #[test]
    fn test_blocked_without_override() {
        let decision = QualityGate::decide(&assessment(50.0, 70.0), None).unwrap();
        assert_eq!(decision, GateDecision::Blocked);
        assert!(!decision.permits_advance());
    }

    #[test]
    fn test_override_requires_actor_and_reason() {
        let failing = assessment(50.0, 70.0);
        assert!(QualityGate::override_gate(&failing, "", "because").is_err());
        assert!(QualityGate::override_gate(&failing, "lead", "  ").is_err());

        let decision = QualityGate::decide(&failing, Some(&OverrideRequest::new("lead", "ship it"))).unwrap();
        match decision {
            GateDecision::Overridden(audit) => {
                assert_eq!(audit.actor, "lead");
                assert_eq!(audit.score, 50.0);
                assert_eq!(audit.threshold, 70.0);
            }
            other => panic!("Expected override, got {:?}", other),
        }
    }

    #[test]
    fn test_passing_gate_ignores_override() {
        let decision =
            QualityGate::decide(&assessment(80.0, 70.0), Some(&OverrideRequest::new("lead", "x"))).unwrap();
        assert_eq!(decision, GateDecision::Passed);
    }

    #[tokio::test]
    async fn test_consensus_scorer_merges_provider_scores() {
        let gateway = Arc::new(
            ProviderGateway::new(Arc::new(CostLedger::new()), RetryPolicy::default())
                .with_provider(Arc::new(ScriptedProvider::new(
                    "a",
                    r#"{"overall_score": 60, "dimensions": {"clarity": 50}, "feedback": "thin"}"#,
                )))
                .with_provider(Arc::new(ScriptedProvider::new(
                    "b",
                    r#"{"overall_score": 80, "dimensions": {"clarity": 70}}"#,
                ))),
        );
        let scorer = ConsensusScorer::new(
            ConsensusAggregator::new(gateway, ConsensusConfig::default()),
            vec![ModelTarget::new("a", "m"), ModelTarget::new("b", "m")],
        );
        let gate = QualityGate::new(Arc::new(scorer));

        let result = gate
            .assess("prd_generation", "the doc", 70.0, &["clarity".to_string()], &Attribution::default())
            .await
            .unwrap();
        assert_eq!(result.overall_score, 70.0);
        assert_eq!(result.dimensions["clarity"], 60.0);
        assert!(result.passes());
        assert!(result.covers("the doc"));
        assert_eq!(result.provider_scores.len(), 2);
        assert!(result.cost > Cost::ZERO);
    }

    #[tokio::test]
    async fn test_unscored_answers_are_malformed() {
        let gateway = Arc::new(
            ProviderGateway::new(Arc::new(CostLedger::new()), RetryPolicy::default())
                .with_provider(Arc::new(ScriptedProvider::new("a", "looks fine to me"))),
        );
        let scorer = ConsensusScorer::new(
            ConsensusAggregator::new(gateway, ConsensusConfig::default()),
            vec![ModelTarget::new("a", "m")],
        );
        let err = scorer
            .score("prd_generation", "doc", &[], &Attribution::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }
}
