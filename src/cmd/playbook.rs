//! Playbook commands: `promptforge validate` and `promptforge run`.

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Map, Value};
use std::path::Path;

use promptforge::engine::{Engine, EventReceiver, ExecutionHandle, RunOptions, events};
use promptforge::ledger::Cost;
use promptforge::playbook::{Playbook, PlaybookExecution, validate};

use super::ui::{CHECK, RunView, print_execution};
use super::Workspace;

/// Flags of `promptforge run`.
pub struct RunArgs {
    pub inputs: Vec<String>,
    pub dry_run: bool,
    pub budget: Option<f64>,
    pub json: bool,
}

pub fn load_playbook(file: &Path) -> Result<Playbook> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read playbook: {}", file.display()))?;
    Playbook::parse(&text).with_context(|| format!("Failed to parse playbook: {}", file.display()))
}

pub fn cmd_validate(file: &Path) -> Result<()> {
    let playbook = load_playbook(file)?;
    let graph = validate(&playbook).with_context(|| format!("{} is not a valid playbook", file.display()))?;
    println!(
        "{}{} is valid ({} steps)",
        CHECK,
        style(&playbook.name).bold(),
        graph.len()
    );
    Ok(())
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type.
pub fn parse_inputs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid input '{}': expected KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid input '{}': empty key", pair);
        }
        inputs.insert(key.to_string(), parse_value(raw));
    }
    Ok(inputs)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn cmd_run(project_dir: &Path, user: &str, file: &Path, args: RunArgs) -> Result<()> {
    let playbook = load_playbook(file)?;
    let inputs = parse_inputs(&args.inputs)?;
    let workspace = Workspace::open(project_dir)?;
    let engine = workspace.engine();

    let (tx, mut rx) = events::channel();
    let mut options = RunOptions::default()
        .dry_run(args.dry_run)
        .with_caller(user)
        .with_events(tx);
    if let Some(budget) = args.budget {
        options = options.with_budget(Cost::from_dollars(budget));
    }

    let handle = engine.start(&playbook, inputs, options).await?;
    let view = RunView::new(args.json);
    let execution = loop {
        let execution = follow(&engine, handle, &mut rx, &view).await?;
        let Some(suspension) = execution.suspension.clone() else {
            break execution;
        };
        let answer = view.suspend(|| ask(&suspension.prompt))?;
        engine.resume(handle, &suspension.step_id, answer).await?;
    };
    view.finish();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }
    if execution.status == promptforge::playbook::ExecutionStatus::Failed {
        bail!("Run {} failed", execution.id);
    }
    Ok(())
}

/// Render events until the run finishes or suspends.
async fn follow(
    engine: &Engine,
    handle: ExecutionHandle,
    rx: &mut EventReceiver,
    view: &RunView,
) -> Result<PlaybookExecution> {
    let wait = engine.wait(handle);
    tokio::pin!(wait);
    let execution = loop {
        tokio::select! {
            Some(event) = rx.recv() => view.event(&event),
            result = &mut wait => break result?,
        }
    };
    while let Ok(event) = rx.try_recv() {
        view.event(&event);
    }
    Ok(execution)
}

fn ask(prompt: &str) -> Result<Value> {
    let answer: String = dialoguer::Input::new()
        .with_prompt(prompt)
        .interact_text()
        .context("Failed to read input")?;
    Ok(parse_value(&answer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inputs() {
        let inputs = parse_inputs(&[
            "name=Ada".to_string(),
            "count=3".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["name"], "Ada");
        assert_eq!(inputs["count"], 3);
        assert_eq!(inputs["tags"], json!(["a", "b"]));
        assert_eq!(inputs["note"], "a=b");
    }

    #[test]
    fn test_parse_inputs_rejects_missing_separator() {
        assert!(parse_inputs(&["name".to_string()]).is_err());
        assert!(parse_inputs(&["=x".to_string()]).is_err());
    }
}
