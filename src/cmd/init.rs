//! Project initialization: `promptforge init`.

use anyhow::{Context, Result};
use std::path::Path;

use promptforge::config::{CONFIG_FILE, STATE_DIR, default_config_toml};

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);
    let existed = config_path.exists();

    for dir in ["store", "logs"] {
        std::fs::create_dir_all(state_dir.join(dir))
            .with_context(|| format!("Failed to create {}", state_dir.join(dir).display()))?;
    }

    if existed && !force {
        println!("promptforge already initialized at {}", state_dir.display());
        println!("Directory structure verified. Use --force to rewrite {}.", CONFIG_FILE);
        return Ok(());
    }

    std::fs::write(&config_path, default_config_toml())
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Initialized promptforge at {}", state_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .promptforge/");
    println!("  ├── promptforge.toml  # Providers, budgets, quality thresholds");
    println!("  ├── store/            # Playbook runs and forge projects");
    println!("  └── logs/             # Daily log files (with --log-file)");
    println!();
    println!("Next steps:");
    println!("  1. Set OPENAI_API_KEY or edit [[providers]] in promptforge.toml");
    println!("  2. Run `promptforge validate <playbook>` to check a playbook");
    println!("  3. Run `promptforge forge new <name> --idea \"...\"` to start a project");
    Ok(())
}
