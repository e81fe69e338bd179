//! Terminal rendering for run events and records.

use console::{Emoji, style};
use indicatif::{ProgressBar, ProgressStyle};
use promptforge::engine::RunEvent;
use promptforge::ledger::Cost;
use promptforge::playbook::{ExecutionStatus, PlaybookExecution};
use std::time::Duration;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[WAIT]");
pub static GATE: Emoji<'_, '_> = Emoji("🚧 ", "[GATE]");

/// Live view of one run: a spinner plus one line per settled step.
pub struct RunView {
    spinner: ProgressBar,
    quiet: bool,
}

impl RunView {
    pub fn new(quiet: bool) -> Self {
        let spinner = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new_spinner();
            let spinner_style = ProgressStyle::default_spinner()
                .template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(spinner_style);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        };
        Self { spinner, quiet }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            self.spinner.println(text);
        }
    }

    pub fn event(&self, event: &RunEvent) {
        match event {
            RunEvent::StepStarted {
                step_id, iteration, ..
            } => match iteration {
                Some(i) => self
                    .spinner
                    .set_message(format!("{} (iteration {})", step_id, i)),
                None => self.spinner.set_message(step_id.clone()),
            },
            RunEvent::StepCompleted { step_id, cost, .. } => self.line(format!(
                "{}{} {}",
                CHECK,
                style(step_id).green(),
                style(cost).dim()
            )),
            RunEvent::StepFailed { step_id, error, .. } => {
                self.line(format!("{}{}: {}", CROSS, style(step_id).red(), error))
            }
            RunEvent::StepSkipped { step_id, .. } => {
                self.line(format!("{}{}", SKIP, style(step_id).dim()))
            }
            RunEvent::Suspended { step_id, .. } => {
                self.line(format!("{}{} is waiting for input", PAUSE, style(step_id).yellow()))
            }
            RunEvent::Resumed { step_id, .. } => {
                self.spinner.set_message(format!("{} resumed", step_id))
            }
            RunEvent::RunFinished { .. } => self.spinner.finish_and_clear(),
        }
    }

    pub fn suspend<T>(&self, f: impl FnOnce() -> T) -> T {
        self.spinner.suspend(f)
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

fn status_label(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => style(status).green().bold().to_string(),
        ExecutionStatus::Failed => style(status).red().bold().to_string(),
        _ => style(status).yellow().bold().to_string(),
    }
}

pub fn print_execution(execution: &PlaybookExecution) {
    println!();
    println!(
        "Run {} of {} {}",
        style(execution.id).dim(),
        style(&execution.playbook_name).bold(),
        status_label(execution.status)
    );
    if execution.dry_run {
        print_estimate(execution);
    } else {
        for (step_id, output) in &execution.results {
            let rendered = match output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            println!("  {} {}", style(format!("{}:", step_id)).cyan(), truncate(&rendered, 100));
        }
        println!("  Total cost: {}", execution.total_cost);
    }
    for error in &execution.errors {
        println!("  {}{}: {}", CROSS, style(&error.step_id).red(), error.message);
    }
}

fn print_estimate(execution: &PlaybookExecution) {
    println!("  (dry run, no provider was called)");
    for (step_id, cost) in &execution.estimated_step_costs {
        println!("  {:<24} {}", step_id, cost);
    }
    println!(
        "  Estimated cost: {}",
        style(execution.estimated_cost.unwrap_or(Cost::ZERO)).bold()
    );
}

pub fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let cut: String = single_line.chars().take(max).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }
}
