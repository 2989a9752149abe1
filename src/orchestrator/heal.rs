//! The `heal` command: hand a failure to the self-healing engine under the
//! project lock.

use super::{CommandOutcome, Conductor};
use crate::errors::Result;
use crate::healing::{
    CommandVerifier, Failure, HealStatus, HealingEngine, HealingPolicy, ShellStrategyExecutor, Verifier,
};
use crate::memory::MemoryStore;

/// Arguments of one `heal` call.
#[derive(Debug, Clone, Default)]
pub struct HealRequest {
    pub error: String,
    pub location: Option<String>,
    pub command: Option<String>,
    pub task: Option<String>,
    /// Label of the step that failed, for the session log.
    pub step: Option<String>,
}

impl Conductor {
    pub async fn heal(&self, request: &HealRequest) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_mutable()?;
        if let Some(task) = &request.task {
            session.project.task(task)?;
        }

        let failure = Failure {
            error: request.error.clone(),
            location: request.location.clone(),
            command: request.command.clone(),
        };
        let healing = &self.config.toml.healing;
        let timeout = self.config.attempt_timeout();
        let executor = ShellStrategyExecutor::new(&self.config.root_dir, healing.tiers.clone(), timeout);
        let verifier = CommandVerifier::new(&self.config.root_dir, healing.verify_command.clone(), timeout);
        let memory = MemoryStore::open(self.config.memory_db_path())?;

        // Attempts run against this checkpoint; a failure streak rolls back to it.
        if verifier.can_verify(&failure) {
            let seq = session.save(&format!("pre-heal {}", failure.signature()))?;
            tracing::debug!(seq, "Checkpoint before healing");
        }
        let dir = session.dir().to_path_buf();
        let engine = HealingEngine::new(
            &dir,
            &memory,
            &executor,
            &verifier,
            HealingPolicy::from_config(&self.config),
        );

        let report = engine.heal(&failure, request.task.as_deref(), &mut session).await?;

        let step = request.step.as_deref().map(|s| format!(" [{}]", s)).unwrap_or_default();
        let message = match report.status {
            HealStatus::Healed => format!(
                "healed {}{} with {}",
                report.signature,
                step,
                report.resolved_by.as_deref().unwrap_or("unknown strategy")
            ),
            HealStatus::Deferred => format!(
                "deferred {}{} after {} attempt(s)",
                report.signature, step, report.total_attempts
            ),
            HealStatus::Systemic => format!(
                "systemic failure {}{} seen on {} tasks",
                report.signature, step, report.occurrences
            ),
        };

        if report.status == HealStatus::Deferred
            && let Some(id) = &request.task
        {
            let task = session.project.task_mut(id)?;
            if !task.status.is_resolved() {
                task.defer(format!("healing exhausted for signature {}", report.signature));
            }
        }
        session.log("heal", &message);
        let seq = session.save(&format!("heal {}", report.signature))?;
        tracing::info!(signature = %report.signature, status = ?report.status, seq, "{}", message);

        if let Some(err) = report.as_error() {
            return Err(err);
        }
        Ok(CommandOutcome::new("heal", message)
            .for_project(&session.project.id, session.project.phase, seq)
            .lines(report.attempts.iter().map(|a| {
                format!("  #{} {} -> {:?}", a.attempt, a.strategy, a.outcome)
            }))
            .warnings(report.rollbacks.iter().map(|r| {
                format!("rolled back to checkpoint {:06} as {:06}", r.restored_seq, r.new_seq)
            }))
            .details(&report))
    }
}
