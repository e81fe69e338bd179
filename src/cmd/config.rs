//! Configuration view and validation commands: `promptforge config`.

use anyhow::Result;
use console::style;
use std::path::Path;

use promptforge::config::{CONFIG_FILE, EngineConfig, STATE_DIR};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(STATE_DIR).join(CONFIG_FILE);
    let config = EngineConfig::resolve(project_dir)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("promptforge configuration").bold());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration. Run 'promptforge init' to create one.");
            }
            println!("Effective values (file + PROMPTFORGE_* environment):");
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
