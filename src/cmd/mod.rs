//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                              |
//! |--------------|---------------------------------------------------------------|
//! | `pipeline`   | `Init`, `Discover`, `SelectAgents`, `Synthesize`, `Finalize`, |
//! |              | `PeGate`, `Resume`, `Status`, `Abort`, `Decide`, remediation  |
//! | `heal`       | `Heal`                                                        |
//! | `memory`     | `Memory`                                                      |
//! | `proc`       | `Proc`                                                        |
//! | `checkpoint` | `Checkpoint`                                                  |
//! | `config`     | `Config`                                                      |

pub mod checkpoint;
pub mod config;
pub mod heal;
pub mod memory;
pub mod pipeline;
pub mod proc;

pub use checkpoint::cmd_checkpoint;
pub use config::cmd_config;
pub use heal::cmd_heal;
pub use memory::cmd_memory;
pub use pipeline::cmd_pipeline;
pub use proc::cmd_proc;

use console::style;
use serde_json::json;

use conductor::errors::ConductorError;
use conductor::orchestrator::CommandOutcome;

/// Print a command result, as text or as one JSON document.
pub fn print_outcome(outcome: &CommandOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!("{} {}", style("✓").green().bold(), outcome.message);
    for line in &outcome.lines {
        println!("  {}", line);
    }
    for warning in &outcome.warnings {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
    Ok(())
}

/// Report a failed command. With `--json` the error document goes to
/// stdout so callers can parse it alongside successful results.
pub fn report_error(err: &ConductorError, json: bool) {
    let unmet = match err {
        ConductorError::Precondition { unmet } => unmet.clone(),
        _ => Vec::new(),
    };
    if json {
        let doc = json!({
            "error": err.kind(),
            "message": format!("{:#}", err),
            "exit_code": err.exit_code(),
            "unmet": unmet,
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(text) => println!("{}", text),
            Err(_) => eprintln!("error: {}", err),
        }
        return;
    }
    if unmet.is_empty() {
        eprintln!("{} {:#}", style("error:").red().bold(), err);
    } else {
        eprintln!("{} {} unmet item(s)", style("blocked:").red().bold(), unmet.len());
    }
    for item in &unmet {
        eprintln!("  {} {}", style("-").red(), item);
    }
    if let ConductorError::Corruption { .. } = err {
        eprintln!("  inspect with 'conductor checkpoint list'");
    }
}
