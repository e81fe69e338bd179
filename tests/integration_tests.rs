//! Integration tests for promptforge
//!
//! The CLI tests drive the binary in a temporary project directory. The
//! library tests wire the engine, gate and pipeline together with an
//! in-process provider.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create a promptforge Command
fn promptforge() -> Command {
    cargo_bin_cmd!("promptforge")
}

fn init_project(dir: &TempDir) {
    promptforge()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn write_playbook(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

const HELLO_PLAYBOOK: &str = r#"{
  "name": "hello",
  "steps": [
    {"id": "greet", "order": 1, "type": "prompt", "config": {"template": "Hello {{inputs.name}}"}},
    {"id": "shout", "order": 2, "type": "transform",
     "config": {"operations": [{"op": "upper", "field": "text", "path": "steps.greet"}]}}
  ]
}"#;

const SUMMARY_PLAYBOOK: &str = r#"
name: summarize
steps:
  - id: draft
    order: 1
    type: prompt
    config:
      template: "Summarize {{inputs.topic}} in three bullet points."
  - id: call
    order: 2
    type: llm_call
    config:
      provider: openai
      model: gpt-4o-mini
      prompt: "{{steps.draft}}"
      max_tokens: 400
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        promptforge()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("forge"));
    }

    #[test]
    fn test_version() {
        promptforge().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        promptforge()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized promptforge"));

        assert!(dir.path().join(".promptforge/promptforge.toml").exists());
        assert!(dir.path().join(".promptforge/store").is_dir());
        assert!(dir.path().join(".promptforge/logs").is_dir());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        promptforge()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }
}

// =============================================================================
// Playbook Commands
// =============================================================================

mod playbook_commands {
    use super::*;

    #[test]
    fn test_validate_accepts_playbook() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(&dir, "hello.json", HELLO_PLAYBOOK);
        promptforge()
            .arg("validate")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid (2 steps)"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(
            &dir,
            "dup.yaml",
            r#"
name: dup
steps:
  - {id: a, order: 1, type: prompt, config: {template: "x"}}
  - {id: a, order: 2, type: prompt, config: {template: "y"}}
"#,
        );
        promptforge()
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Duplicate step id: a"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(
            &dir,
            "cycle.json",
            r#"{"name": "cycle", "steps": [
                {"id": "a", "order": 1, "type": "prompt", "config": {"template": "x"}, "next_steps": ["b"]},
                {"id": "b", "order": 2, "type": "prompt", "config": {"template": "y"}, "next_steps": ["a"]}
            ]}"#,
        );
        promptforge()
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle detected"));
    }

    #[test]
    fn test_run_prompt_only_playbook() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(&dir, "hello.json", HELLO_PLAYBOOK);
        let output = promptforge()
            .current_dir(dir.path())
            .args(["run", "--json", "-i", "name=world"])
            .arg(&path)
            .output()
            .unwrap();
        assert!(output.status.success());

        let execution: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(execution["status"], "completed");
        assert_eq!(execution["results"]["greet"], "Hello world");
        assert_eq!(execution["results"]["shout"]["text"], "HELLO WORLD");
        assert_eq!(execution["owner"], "local");
    }

    #[test]
    fn test_run_missing_input_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(&dir, "hello.json", HELLO_PLAYBOOK);
        promptforge()
            .current_dir(dir.path())
            .arg("run")
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("inputs.name"));
    }

    #[test]
    fn test_dry_run_estimates_without_calling_provider() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let path = write_playbook(&dir, "summary.yaml", SUMMARY_PLAYBOOK);
        promptforge()
            .current_dir(dir.path())
            .env_remove("OPENAI_API_KEY")
            .args(["run", "--dry-run", "-i", "topic=rust"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("dry run"))
            .stdout(predicate::str::contains("Estimated cost"));
    }

    #[test]
    fn test_dry_run_reports_unknown_provider() {
        let dir = TempDir::new().unwrap();
        let path = write_playbook(&dir, "summary.yaml", SUMMARY_PLAYBOOK);
        promptforge()
            .current_dir(dir.path())
            .args(["run", "--dry-run", "-i", "topic=rust"])
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("openai"));
    }
}

// =============================================================================
// Config Commands
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        promptforge()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("max_parallel = 4"));
    }

    #[test]
    fn test_config_show_applies_env() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        promptforge()
            .current_dir(dir.path())
            .env("PROMPTFORGE_MAX_PARALLEL", "9")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel = 9"))
            .stdout(predicate::str::contains("gpt-4o-mini"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".promptforge")).unwrap();
        fs::write(
            dir.path().join(".promptforge/promptforge.toml"),
            "[quality]\ndefault_threshold = 150\n",
        )
        .unwrap();
        promptforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("outside 0..=100"));
    }
}

// =============================================================================
// Forge Commands
// =============================================================================

mod forge_commands {
    use super::*;

    #[test]
    fn test_forge_new_and_list() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        promptforge()
            .current_dir(dir.path())
            .args(["forge", "new", "todo-app", "--idea", "A todo list for teams"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created project"))
            .stdout(predicate::str::contains("Idea Refinement"));

        promptforge()
            .current_dir(dir.path())
            .args(["forge", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("todo-app"))
            .stdout(predicate::str::contains("draft"));
    }

    #[test]
    fn test_forge_projects_are_per_user() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        promptforge()
            .current_dir(dir.path())
            .args(["--user", "ada", "forge", "new", "ada-app", "--idea", "x"])
            .assert()
            .success();
        promptforge()
            .current_dir(dir.path())
            .args(["--user", "bob", "forge", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No projects yet"));
    }

    #[test]
    fn test_forge_export_markdown() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        promptforge()
            .current_dir(dir.path())
            .args(["forge", "new", "notes", "--idea", "x"])
            .assert()
            .success();
        let listing = promptforge()
            .current_dir(dir.path())
            .args(["forge", "list"])
            .output()
            .unwrap();
        let stdout = String::from_utf8(listing.stdout).unwrap();
        let id = stdout.lines().nth(1).unwrap().split_whitespace().next().unwrap();

        promptforge()
            .current_dir(dir.path())
            .args(["forge", "export", &id[..8], "--format", "md"])
            .assert()
            .success()
            .stdout(predicate::str::contains("# notes"));
    }

    #[test]
    fn test_forge_override_requires_actor() {
        promptforge()
            .args(["forge", "advance", "abc", "--override-reason", "ship it"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Library End To End
// =============================================================================

mod library {
    use async_trait::async_trait;
    use promptforge::consensus::{ConsensusAggregator, ConsensusConfig};
    use promptforge::engine::{Engine, RunOptions};
    use promptforge::errors::ProviderError;
    use promptforge::gates::{ConsensusScorer, QualityGate};
    use promptforge::ledger::{CostLedger, ModelPricing, TokenUsage};
    use promptforge::pipeline::{AdvanceOutcome, PipelineSettings, ProjectStatus, Stage, StagePipeline};
    use promptforge::playbook::{
        ExecutionStatus, HumanInputConfig, LlmCallConfig, ModelTarget, Playbook, PromptConfig,
        Step, StepKind,
    };
    use promptforge::provider::{
        Completion, CompletionRequest, Provider, ProviderFailure, ProviderGateway, RetryPolicy,
    };
    use promptforge::service::{Caller, ForgeService};
    use promptforge::store::MemoryStore;
    use serde_json::{Map, json};
    use std::sync::Arc;

    /// Writes documents, and scores anything it is asked to review.
    struct Studio {
        score: f64,
    }

    #[async_trait]
    impl Provider for Studio {
        fn name(&self) -> &str {
            "studio"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderFailure> {
            if request.prompt.is_empty() {
                return Err(ProviderError::BadRequest {
                    provider: "studio".into(),
                    message: "empty prompt".into(),
                }
                .into());
            }
            let content = if request.prompt.contains("--- ARTIFACT ---") {
                json!({"overall_score": self.score, "dimensions": {"clarity": self.score}, "feedback": "fine"})
                    .to_string()
            } else {
                format!("Document for: {}", request.prompt.lines().next().unwrap_or_default())
            };
            Ok(Completion {
                content,
                usage: TokenUsage::new(1000, 500),
            })
        }

        fn pricing(&self, _model: &str) -> Option<ModelPricing> {
            Some(ModelPricing::new(1.0, 2.0))
        }
    }

    fn gateway(score: f64) -> Arc<ProviderGateway> {
        Arc::new(
            ProviderGateway::new(Arc::new(CostLedger::new()), RetryPolicy::default())
                .with_provider(Arc::new(Studio { score })),
        )
    }

    fn forge(score: f64) -> ForgeService {
        let gateway = gateway(score);
        let engine = Engine::builder(gateway.clone()).build();
        let aggregator = ConsensusAggregator::new(gateway, ConsensusConfig::default());
        let scorer = ConsensusScorer::new(aggregator, vec![ModelTarget::new("studio", "judge")]);
        let pipeline = StagePipeline::new(
            engine,
            QualityGate::new(Arc::new(scorer)),
            PipelineSettings::new(ModelTarget::new("studio", "writer")),
        );
        ForgeService::new(Arc::new(MemoryStore::new()), pipeline)
    }

    #[tokio::test]
    async fn test_project_runs_through_all_stages() {
        let service = forge(85.0);
        let caller = Caller::new("ada");
        let project = service
            .create_project(&caller, "todo", "A todo app for teams", None)
            .await
            .unwrap();

        let mut last = None;
        for _ in Stage::ALL {
            last = Some(service.advance_stage(&caller, project.id, None).await.unwrap());
        }
        let Some(AdvanceOutcome::Completed { project, assessment, .. }) = last else {
            panic!("expected the final advance to complete the project");
        };
        assert_eq!(project.status, ProjectStatus::Completed);
        assert_eq!(project.progress_percentage, 100.0);
        assert_eq!(project.artifacts.len(), 5);
        assert_eq!(assessment.overall_score, 85.0);
        // 5 generations and 5 assessments at 1000/500 tokens, $1/$2 per million.
        assert_eq!(project.total_cost.micros(), 10 * 2000);
        assert!(project.overrides.is_empty());
    }

    #[tokio::test]
    async fn test_low_score_blocks_until_override() {
        let service = forge(40.0);
        let caller = Caller::new("ada");
        let project = service.create_project(&caller, "todo", "idea", None).await.unwrap();

        let blocked = service.advance_stage(&caller, project.id, None).await.unwrap();
        assert!(blocked.is_blocked());
        assert_eq!(blocked.project().current_stage, Stage::IdeaRefinement);

        let request = promptforge::gates::OverrideRequest::new("lead", "accepting a thin brief");
        let advanced = service
            .advance_stage(&caller, project.id, Some(&request))
            .await
            .unwrap();
        assert_eq!(advanced.project().current_stage, Stage::PrdGeneration);
        let audit = &advanced.project().overrides[0];
        assert_eq!(audit.actor, "lead");
        assert_eq!(audit.score, 40.0);
    }

    #[tokio::test]
    async fn test_playbook_suspends_and_resumes() {
        let engine = Engine::builder(gateway(0.0)).build();
        let playbook = Playbook::new(
            "review",
            vec![
                Step::new(
                    "draft",
                    1,
                    StepKind::LlmCall(LlmCallConfig::new("studio", "writer", "Write about {{inputs.topic}}")),
                ),
                Step::new(
                    "approve",
                    2,
                    StepKind::HumanInput(HumanInputConfig {
                        prompt: "Publish?".into(),
                        timeout_secs: None,
                    }),
                ),
                Step::new(
                    "publish",
                    3,
                    StepKind::Prompt(PromptConfig {
                        template: "{{steps.approve}}: {{steps.draft.content}}".into(),
                    }),
                ),
            ],
        );
        let mut inputs = Map::new();
        inputs.insert("topic".into(), json!("tides"));

        let handle = engine
            .start(&playbook, inputs, RunOptions::default().with_caller("ada"))
            .await
            .unwrap();
        let suspended = engine.wait(handle).await.unwrap();
        assert_eq!(suspended.status, ExecutionStatus::Running);
        assert_eq!(suspended.suspension.as_ref().unwrap().step_id, "approve");
        assert!(!suspended.results.contains_key("publish"));

        engine.resume(handle, "approve", json!("yes")).await.unwrap();
        let done = engine.wait(handle).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.results["publish"], "yes: Document for: Write about tides");
        assert_eq!(done.total_cost.micros(), 2000);
        assert!(engine.ledger().run_records(handle.id()).is_empty());
    }
}
