//! Checkpoint inspection and restore: `conductor checkpoint`.

use conductor::errors::Result;
use conductor::orchestrator::{CommandOutcome, Conductor};

use super::super::CheckpointCommands;
use super::print_outcome;

pub fn cmd_checkpoint(conductor: &Conductor, command: CheckpointCommands) -> Result<()> {
    let outcome = match command {
        CheckpointCommands::List => {
            let (id, entries) = conductor.checkpoint_list()?;
            CommandOutcome::new("checkpoint list", format!("{}: {} checkpoint(s)", id, entries.len()))
                .lines(entries.iter().map(|e| {
                    format!(
                        "  {:06} {} {} {}",
                        e.seq,
                        if e.valid { "ok     " } else { "INVALID" },
                        e.phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                        e.reason.as_deref().or(e.problem.as_deref()).unwrap_or("")
                    )
                }))
                .details(&entries)
        }
        CheckpointCommands::Verify => conductor.checkpoint_verify()?,
        CheckpointCommands::Restore { seq, reason } => conductor.checkpoint_restore(seq, &reason)?,
    };
    print_outcome(&outcome, conductor.config.json)?;
    Ok(())
}
