//! Process supervision commands: `conductor proc`.

use conductor::errors::Result;
use conductor::orchestrator::{CommandOutcome, Conductor};
use conductor::supervisor::SweepOptions;
use conductor::supervisor::process::parent_pid;

use super::super::ProcCommands;
use super::print_outcome;

pub fn cmd_proc(conductor: &Conductor, command: ProcCommands) -> Result<()> {
    let dir = conductor.current_dir()?;
    let supervisor = conductor.supervisor(&dir);

    let outcome = match command {
        ProcCommands::Register {
            pid,
            kind,
            purpose,
            owner,
        } => {
            let owner = owner.or_else(|| Some(parent_pid()).filter(|p| *p > 1));
            let record = supervisor.register(pid, kind, &purpose, owner)?;
            CommandOutcome::new("proc register", format!("registered {} {} ({})", kind, pid, purpose))
                .details(&record)
        }
        ProcCommands::Heartbeat { pid } => {
            let record = supervisor.heartbeat(pid)?;
            CommandOutcome::new("proc heartbeat", format!("heartbeat for {}", pid)).details(&record)
        }
        ProcCommands::Deregister { pid } => match supervisor.deregister(pid)? {
            Some(record) => {
                CommandOutcome::new("proc deregister", format!("deregistered {}", pid)).details(&record)
            }
            None => CommandOutcome::new("proc deregister", format!("{} was not registered", pid)),
        },
        ProcCommands::Sweep {
            dry_run,
            force,
            pids,
        } => {
            let report = supervisor.sweep(&SweepOptions {
                dry_run: dry_run || conductor.config.dry_run(),
                force,
                candidates: pids,
                observed: supervisor.runtime_pids()?,
            })?;
            CommandOutcome::new("proc sweep", report.summary())
                .lines(report.terminated.iter().map(|a| {
                    format!("  {} {}: {}", a.pid, a.purpose, a.reason)
                }))
                .lines(report.dropped.iter().map(|a| {
                    format!("  dropped {} {}: {}", a.pid, a.purpose, a.reason)
                }))
                .warnings(report.warnings.clone())
                .details(&report)
        }
        ProcCommands::Status => {
            let statuses = supervisor.status()?;
            CommandOutcome::new("proc status", format!("{} registered process(es)", statuses.len()))
                .lines(statuses.iter().map(|s| {
                    format!(
                        "  {} {} {} {:?}{}",
                        s.record.pid,
                        s.record.kind,
                        s.record.purpose,
                        s.liveness,
                        if s.orphan { " orphan" } else { "" }
                    )
                }))
                .details(&statuses)
        }
    };
    print_outcome(&outcome, conductor.config.json)?;
    Ok(())
}
