//! Forge project commands: `promptforge forge`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use uuid::Uuid;

use promptforge::gates::{OverrideRequest, QualityAssessment};
use promptforge::ledger::Cost;
use promptforge::pipeline::{AdvanceOutcome, ArtifactExport, ExportFormat, ForgeProject, Stage};
use promptforge::service::{Caller, ForgeService};

use super::super::ForgeCommands;
use super::Workspace;
use super::ui::{CHECK, CROSS, GATE, truncate};

pub async fn cmd_forge(project_dir: &Path, user: &str, command: ForgeCommands) -> Result<()> {
    let workspace = Workspace::open(project_dir)?;
    let service = workspace.forge_service()?;
    let caller = Caller::new(user);

    match command {
        ForgeCommands::New { name, idea, budget } => {
            let project = service
                .create_project(&caller, &name, &idea, budget.map(Cost::from_dollars))
                .await?;
            println!("{}Created project {}", CHECK, style(&project.name).bold());
            println!("  id:    {}", project.id);
            println!("  stage: {}", project.current_stage.title());
            println!();
            println!("Run `promptforge forge advance {}` to generate the first stage.", project.id);
        }
        ForgeCommands::List => {
            let projects = service.list_projects(&caller).await?;
            if projects.is_empty() {
                println!("No projects yet. Create one with `promptforge forge new`.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<20} {:<10} {:>5}  {}",
                "ID", "NAME", "STATUS", "DONE", "STAGE"
            );
            for project in projects {
                println!(
                    "{:<36}  {:<20} {:<10} {:>4.0}%  {}",
                    project.id,
                    truncate(&project.name, 20),
                    project.status,
                    project.progress_percentage,
                    project.current_stage.title()
                );
            }
        }
        ForgeCommands::Show { id } => {
            let id = resolve_id(&service, &caller, &id).await?;
            print_project(&service.get_project(&caller, id).await?);
        }
        ForgeCommands::Advance {
            id,
            override_reason,
            actor,
        } => {
            let id = resolve_id(&service, &caller, &id).await?;
            let request = match (actor, override_reason) {
                (Some(actor), Some(reason)) => Some(OverrideRequest::new(&actor, &reason)),
                _ => None,
            };
            let outcome = service.advance_stage(&caller, id, request.as_ref()).await?;
            print_outcome(&outcome);
        }
        ForgeCommands::Assess { id, stage } => {
            let id = resolve_id(&service, &caller, &id).await?;
            let stage = match stage {
                Some(name) => name.parse::<Stage>().map_err(anyhow::Error::msg)?,
                None => service.get_project(&caller, id).await?.current_stage,
            };
            let assessment = service.quality_assessment(&caller, id, stage).await?;
            print_assessment(&assessment);
        }
        ForgeCommands::Export { id, format, output } => {
            let id = resolve_id(&service, &caller, &id).await?;
            let format = format.parse::<ExportFormat>().map_err(anyhow::Error::msg)?;
            let export = service.export_artifact(&caller, id, format).await?;
            let rendered = match format {
                ExportFormat::Json => serde_json::to_string_pretty(&export)?,
                ExportFormat::Markdown => render_markdown(&export),
                ExportFormat::Pdf | ExportFormat::Zip => bail!(
                    "{:?} export needs a document renderer; use --format markdown or json",
                    format
                ),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{}Exported to {}", CHECK, path.display());
                }
                None => println!("{}", rendered),
            }
        }
    }

    Ok(())
}

/// Accept a full id or a unique prefix of one.
async fn resolve_id(service: &ForgeService, caller: &Caller, raw: &str) -> Result<Uuid> {
    if let Ok(id) = raw.parse::<Uuid>() {
        return Ok(id);
    }
    let matches: Vec<Uuid> = service
        .list_projects(caller)
        .await?
        .into_iter()
        .map(|p| p.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No project matches '{}'", raw),
        _ => bail!("'{}' matches {} projects; use more characters", raw, matches.len()),
    }
}

fn print_project(project: &ForgeProject) {
    println!();
    println!("{} {}", style(&project.name).bold(), style(project.id).dim());
    println!("  status:   {}", project.status);
    println!("  progress: {:.0}%", project.progress_percentage);
    println!("  cost:     {}", project.total_cost);
    println!();
    for stage in Stage::ALL {
        let marker = if stage == project.current_stage { ">" } else { " " };
        let score = project
            .artifact(stage)
            .and_then(|a| a.assessment.as_ref())
            .map(|a| format!("{:.1} / {:.0}", a.overall_score, a.threshold))
            .unwrap_or_else(|| "-".to_string());
        println!("{} {:<28} {}", marker, stage.title(), score);
    }
    for o in &project.overrides {
        println!();
        println!(
            "{}{} overridden by {} ({:.1} < {:.0}): {}",
            GATE, o.stage, o.actor, o.score, o.threshold, o.reason
        );
    }
}

fn print_assessment(assessment: &QualityAssessment) {
    let verdict = if assessment.passes() {
        format!("{}{}", CHECK, style("passes").green())
    } else {
        format!("{}{}", CROSS, style("below threshold").red())
    };
    println!(
        "{}: {:.1} / {:.0} {}",
        assessment.stage, assessment.overall_score, assessment.threshold, verdict
    );
    for (dimension, score) in &assessment.dimensions {
        println!("  {:<16} {:.1}", dimension, score);
    }
    if let Some(agreement) = assessment.agreement {
        println!("  agreement        {:.2}", agreement);
    }
    if let Some(feedback) = &assessment.feedback {
        println!();
        println!("{}", feedback);
    }
}

fn print_outcome(outcome: &AdvanceOutcome) {
    print_assessment(outcome.assessment());
    println!();
    let project = outcome.project();
    match outcome {
        AdvanceOutcome::Advanced { overridden, .. } => {
            if overridden.is_some() {
                println!("{}Gate overridden.", GATE);
            }
            println!(
                "{}Advanced to {}",
                CHECK,
                style(project.current_stage.title()).bold()
            );
        }
        AdvanceOutcome::Completed { .. } => {
            println!("{}Project {} is complete.", CHECK, style(&project.name).bold());
        }
        AdvanceOutcome::Blocked { .. } => {
            println!(
                "{}Blocked at {}. Revise the artifact or pass --override-reason and --actor.",
                GATE,
                project.current_stage.title()
            );
        }
    }
    println!("Project cost so far: {}", project.total_cost);
}

fn render_markdown(export: &ArtifactExport) -> String {
    let mut out = format!("# {}\n\n", export.name);
    out.push_str(&format!(
        "Status: {} | Progress: {:.0}% | Cost: {}\n",
        export.status, export.progress_percentage, export.total_cost
    ));
    for stage in &export.stages {
        out.push_str(&format!("\n## {}\n\n", stage.title));
        if let (Some(score), Some(threshold)) = (stage.score, stage.threshold) {
            out.push_str(&format!("_Quality score {:.1} (threshold {:.0})_\n\n", score, threshold));
        }
        out.push_str(stage.content.trim_end());
        out.push('\n');
    }
    out
}
