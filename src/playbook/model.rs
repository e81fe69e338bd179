//! Playbook and step definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Identity of a step within a playbook.
pub type StepId = String;

/// Who can see a playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Team,
    Public,
}

/// A user-authored graph of steps executed as one automation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub visibility: Visibility,
    /// Designated start step. Defaults to the lowest-ordered top-level step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step: Option<StepId>,
    pub steps: Vec<Step>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Playbook {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            owner: String::new(),
            version: 1,
            visibility: Visibility::Private,
            start_step: None,
            steps,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_start(mut self, step: &str) -> Self {
        self.start_step = Some(step.to_string());
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// SHA-256 over the serialized step set and start step.
    ///
    /// Recorded on every execution so a run can be tied to the exact graph it ran.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(start) = &self.start_step {
            hasher.update(start.as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(serde_json::to_vec(&self.steps).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    /// Parse a playbook from JSON or YAML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(text)?)
        } else {
            Ok(serde_yaml::from_str(text)?)
        }
    }
}

/// A single typed unit of work inside a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    /// Display and tie-break hint. Not authoritative for execution order.
    #[serde(default)]
    pub order: i32,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Explicit successors. `None` means "the next step by order".
    #[serde(
        default,
        alias = "nextSteps",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_steps: Option<Vec<StepId>>,
}

impl Step {
    pub fn new(id: &str, order: i32, kind: StepKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            order,
            kind,
            next_steps: None,
        }
    }

    pub fn then(mut self, next: &[&str]) -> Self {
        self.next_steps = Some(next.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// The closed set of step types, each carrying its own config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum StepKind {
    Prompt(PromptConfig),
    LlmCall(LlmCallConfig),
    Transform(TransformConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    HumanInput(HumanInputConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Prompt(_) => StepType::Prompt,
            Self::LlmCall(_) => StepType::LlmCall,
            Self::Transform(_) => StepType::Transform,
            Self::Condition(_) => StepType::Condition,
            Self::Loop(_) => StepType::Loop,
            Self::HumanInput(_) => StepType::HumanInput,
        }
    }
}

/// Step type tag without config, for logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Prompt,
    LlmCall,
    Transform,
    Condition,
    Loop,
    HumanInput,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::LlmCall => "llm_call",
            Self::Transform => "transform",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::HumanInput => "human_input",
        };
        f.write_str(s)
    }
}

/// Renders a template against the run context. No external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Template with `{{path}}` placeholders; `{{path?}}` marks an optional one.
    pub template: String,
}

/// A provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Invokes one provider, or several through consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    /// Prompt template rendered against the run context.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Extra targets; when non-empty the call goes through the consensus aggregator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
}

impl LlmCallConfig {
    pub fn new(provider: &str, model: &str, prompt: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            system: None,
            max_tokens: None,
            temperature: None,
            models: Vec::new(),
            quorum: None,
        }
    }

    /// All targets this call fans out to, primary first.
    pub fn targets(&self) -> Vec<ModelTarget> {
        let mut targets = Vec::new();
        if !self.provider.is_empty() {
            targets.push(ModelTarget::new(&self.provider, &self.model));
        }
        for target in &self.models {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        targets
    }

    pub fn is_consensus(&self) -> bool {
        self.targets().len() > 1
    }
}

/// A declarative reshaping of prior results. Pure, no cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub operations: Vec<TransformOp>,
}

/// One field-producing transform operation.
///
/// `path` reads from the run context; `out.<field>` reads a field written by
/// an earlier operation of the same transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Set { field: String, template: String },
    Pick { field: String, path: String },
    Json { field: String, path: String },
    Split {
        field: String,
        path: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
    Join {
        field: String,
        path: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
    Upper { field: String, path: String },
    Lower { field: String, path: String },
    Trim { field: String, path: String },
    Length { field: String, path: String },
}

fn default_separator() -> String {
    "\n".to_string()
}

/// Branches to exactly one of two successors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub expression: String,
    pub if_true: StepId,
    pub if_false: StepId,
}

/// Re-enters a named sub-graph until a bound or condition is met.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Steps forming the loop body; the first one is the body entry.
    pub body: Vec<StepId>,
    pub max_iterations: u32,
    /// Stop once this expression holds after an iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    /// Run the body exactly this many times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Suspends the run until a value is supplied through `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputConfig {
    pub prompt: String,
    /// Cancel the run if no input arrives within this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_serializes_with_type_tag() {
        let step = Step::new(
            "A",
            1,
            StepKind::Prompt(PromptConfig {
                template: "Hello {{name}}".into(),
            }),
        )
        .then(&["B"]);

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "prompt");
        assert_eq!(json["config"]["template"], "Hello {{name}}");
        assert_eq!(json["next_steps"][0], "B");

        let back: Step = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_parse_yaml_playbook() {
        let yaml = r#"
name: Summarize
steps:
  - id: draft
    order: 1
    type: prompt
    config:
      template: "Summarize {{topic}}"
  - id: call
    order: 2
    type: llm_call
    config:
      provider: openai
      model: gpt-4o-mini
      prompt: "{{steps.draft}}"
    nextSteps: []
"#;
        let playbook = Playbook::parse(yaml).unwrap();
        assert_eq!(playbook.steps.len(), 2);
        assert_eq!(playbook.version, 1);
        assert_eq!(playbook.steps[1].step_type(), StepType::LlmCall);
        assert_eq!(playbook.steps[1].next_steps, Some(vec![]));
        assert!(playbook.steps[0].next_steps.is_none());
    }

    #[test]
    fn test_llm_targets_dedupe() {
        let mut config = LlmCallConfig::new("openai", "gpt", "hi");
        assert!(!config.is_consensus());
        config.models = vec![ModelTarget::new("openai", "gpt"), ModelTarget::new("anthropic", "claude")];
        assert_eq!(config.targets().len(), 2);
        assert!(config.is_consensus());
    }

    #[test]
    fn test_digest_tracks_steps() {
        let a = Playbook::new(
            "p",
            vec![Step::new("A", 1, StepKind::Prompt(PromptConfig { template: "x".into() }))],
        );
        let mut b = a.clone();
        assert_eq!(a.digest(), b.digest());
        b.steps[0].order = 2;
        assert_ne!(a.digest(), b.digest());
    }
}
