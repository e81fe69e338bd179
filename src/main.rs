use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "promptforge")]
#[command(version, about = "Playbook runner and quality-gated Forge pipeline for LLM workflows")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Also write logs to a daily file under .promptforge/logs/
    #[arg(long, global = true)]
    pub log_file: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Identity used for ownership and cost attribution
    #[arg(long, env = "PROMPTFORGE_USER", default_value = "local", global = true)]
    pub user: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .promptforge/ with a starter configuration
    Init {
        /// Overwrite an existing promptforge.toml
        #[arg(long)]
        force: bool,
    },
    /// Validate a playbook file (JSON or YAML)
    Validate { file: PathBuf },
    /// Execute a playbook file
    Run {
        file: PathBuf,
        /// Input as key=value; values that parse as JSON are taken as JSON
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Estimate cost without calling any provider
        #[arg(long)]
        dry_run: bool,
        /// Spending cap for this run in USD
        #[arg(long)]
        budget: Option<f64>,
        /// Print the final execution record as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Forge projects: idea to implementation playbook in five gated stages
    Forge {
        #[command(subcommand)]
        command: ForgeCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum ForgeCommands {
    /// Create a project from an idea
    New {
        name: String,
        #[arg(long)]
        idea: String,
        /// Project budget in USD
        #[arg(long)]
        budget: Option<f64>,
    },
    /// List your projects
    List,
    /// Show a project's stages and scores
    Show { id: String },
    /// Generate, assess and try to advance the current stage
    Advance {
        id: String,
        /// Advance past a failing gate, recording this reason
        #[arg(long, requires = "actor")]
        override_reason: Option<String>,
        /// Who authorizes the override
        #[arg(long, requires = "override_reason")]
        actor: Option<String>,
    },
    /// Re-score a stage's artifact
    Assess {
        id: String,
        /// Defaults to the current stage
        #[arg(long)]
        stage: Option<String>,
    },
    /// Export every stage artifact
    Export {
        id: String,
        #[arg(long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(cli: &Cli, project_dir: &std::path::Path) -> Option<WorkerGuard> {
    let default_filter = if cli.verbose {
        "promptforge=debug"
    } else {
        "promptforge=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr = match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file, guard) = if cli.log_file {
        let appender = tracing_appender::rolling::daily(
            project_dir.join(promptforge::config::STATE_DIR).join("logs"),
            "promptforge.log",
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new("promptforge=info"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr.with_filter(filter))
        .with(file)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _guard = init_tracing(&cli, &project_dir);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Validate { file } => cmd::cmd_validate(file)?,
        Commands::Run {
            file,
            inputs,
            dry_run,
            budget,
            json,
        } => {
            let options = cmd::RunArgs {
                inputs: inputs.clone(),
                dry_run: *dry_run,
                budget: *budget,
                json: *json,
            };
            cmd::cmd_run(&project_dir, &cli.user, file, options).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Forge { command } => {
            cmd::cmd_forge(&project_dir, &cli.user, command.clone()).await?
        }
    }

    Ok(())
}
