//! Phase and remediation commands.

use conductor::errors::{ConductorError, Result};
use conductor::orchestrator::{Conductor, GateOverride};

use super::super::Commands;
use super::print_outcome;

pub async fn cmd_pipeline(conductor: &Conductor, command: &Commands) -> Result<()> {
    let outcome = match command {
        Commands::Init {
            request,
            lite,
            fix_policy,
        } => conductor.init(request, *lite, *fix_policy)?,
        Commands::Discover => conductor.discover()?,
        Commands::SelectAgents { max } => conductor.select_agents(*max)?,
        Commands::Synthesize => conductor.synthesize()?,
        Commands::Remediate => conductor.remediate()?,
        Commands::RemediateDone {
            task,
            defer,
            reason,
        } => conductor.remediate_done(task, *defer, reason.as_deref()).await?,
        Commands::RemediateVerify => conductor.remediate_verify()?,
        Commands::CoeAnalyze { task, validate } => conductor.coe_analyze(task, *validate)?,
        Commands::PatternSweep { task } => conductor.pattern_sweep(task)?,
        Commands::PeGate {
            from,
            to,
            force,
            overrides,
            reason,
        } => conductor.pe_gate(
            *from,
            *to,
            GateOverride {
                force: *force,
                rules: overrides.clone(),
                reason: reason.clone(),
            },
        )?,
        Commands::Finalize => conductor.finalize()?,
        Commands::Resume => conductor.resume()?,
        Commands::Status => conductor.status()?,
        Commands::Abort { reason } => conductor.abort(reason)?,
        Commands::Decide { text } => conductor.decide(text)?,
        Commands::Heal { .. }
        | Commands::Memory { .. }
        | Commands::Proc { .. }
        | Commands::Checkpoint { .. }
        | Commands::Config { .. } => {
            return Err(ConductorError::Other(anyhow::anyhow!(
                "not a pipeline command"
            )));
        }
    };
    print_outcome(&outcome, conductor.config.json)?;
    Ok(())
}
