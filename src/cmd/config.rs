//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;
use std::path::Path;

use conductor::conductor_config::{CONDUCTOR_DIR, CONFIG_FILE, CliOverrides, ConductorConfig, ConductorToml};
use conductor::healing::StrategyTier;

use super::super::ConfigCommands;

fn print_toml(toml: &ConductorToml) {
    let p = &toml.pipeline;
    println!("[pipeline]");
    println!("  mode = \"{}\"", p.mode);
    println!("  approval = \"{}\"", p.approval);
    println!("  fix_policy = \"{}\"", p.fix_policy);
    if let Some(max) = p.max_agents {
        println!("  max_agents = {}", max);
    }
    println!();

    let h = &toml.healing;
    println!("[healing]");
    println!("  max_attempts = {}", h.max_attempts);
    println!("  recurrence_threshold = {}", h.recurrence_threshold);
    println!("  rollback_failures = {}", h.rollback_failures);
    println!("  rollback_window_secs = {}", h.rollback_window_secs);
    println!("  attempt_timeout_secs = {}", h.attempt_timeout_secs);
    if let Some(cmd) = &h.verify_command {
        println!("  verify_command = \"{}\"", cmd);
    }
    for tier in StrategyTier::ALL {
        if let Some(cmd) = h.tiers.command_for(tier) {
            println!("  tiers.{} = \"{}\"", tier, cmd);
        }
    }
    println!();

    println!("[checkpoint]");
    println!("  lock_timeout_ms = {}", toml.checkpoint.lock_timeout_ms);
    println!();

    println!("[supervisor]");
    println!("  stale_after_secs = {}", toml.supervisor.stale_after_secs);
    println!("  term_grace_ms = {}", toml.supervisor.term_grace_ms);
    println!("  dry_run = {}", toml.supervisor.dry_run);
    println!();
}

pub fn cmd_config(root: &Path, cli: CliOverrides, command: Option<ConfigCommands>) -> Result<()> {
    let conductor_dir = root.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&ConductorToml::load(&config_path)?);
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                println!();
                print_toml(&ConductorToml::default());
                println!("Run 'conductor config init' to create a conductor.toml file.");
                println!();
            }

            // Effective values, including env and CLI overrides
            let config = ConductorConfig::load(root.to_path_buf(), cli)?;
            println!("Effective values (with env/CLI overrides):");
            println!("  fix_policy = \"{}\"", config.fix_policy());
            println!("  approval = \"{}\"", config.approval());
            println!("  dry_run = {}", config.dry_run());
            println!("  memory_db = \"{}\"", config.memory_db_path().display());
            println!("  logs = \"{}\"", config.log_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&conductor_dir)?;
            ConductorToml::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] mode, approval, fix_policy, max_agents");
            println!("  - [healing] attempt limits, verify_command, [healing.tiers] commands");
            println!("  - [supervisor] stale_after_secs, term_grace_ms");
            println!();
        }
    }

    Ok(())
}
