//! Execute-phase commands: working, closing and verifying remediation tasks.

use super::{CommandOutcome, Conductor};
use crate::errors::{ConductorError, Result};
use crate::phase::PhaseId;
use crate::remediation::{self, TaskStatus, sweep};

impl Conductor {
    /// Pick the next auto-fix task, start it and scaffold its documents.
    pub fn remediate(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Execute)?;
        let Some(id) = remediation::next_task(&session.project).map(|t| t.id.clone()) else {
            return Ok(CommandOutcome::new("remediate", "no open tasks; run 'conductor remediate-verify'")
                .for_project(&session.project.id, session.project.phase, session.seq));
        };

        let dir = session.dir().to_path_buf();
        let task = session.project.task_mut(&id)?;
        let was = task.status;
        let task_dir = remediation::start_task(&dir, task)?;
        let task = task.clone();

        let seq = if was != task.status {
            session.log("remediate", &format!("started {}: {}", task.id, task.title));
            session.save(&format!("remediate: start {}", task.id))?
        } else {
            session.seq
        };
        Ok(CommandOutcome::new("remediate", format!("working on {}: {}", task.id, task.title))
            .for_project(&session.project.id, session.project.phase, seq)
            .line(format!("severity: {}, role: {}", task.severity, task.role))
            .line(format!("coe: {}", remediation::coe::coe_path(&task_dir).display()))
            .line(format!(
                "evidence: {}",
                task_dir.join(remediation::EVIDENCE_FILE).display()
            ))
            .line(format!("when done: conductor remediate-done --task {}", task.id))
            .details(&task))
    }

    /// Scaffold or check a task's COE. With `validate`, record the result.
    pub fn coe_analyze(&self, task_id: &str, validate: bool) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Execute)?;
        let task_dir = remediation::task_dir(session.dir(), task_id);
        let task = session.project.task(task_id)?.clone();
        let report = remediation::analyze_coe(&task_dir, &task)?;

        let mut outcome = CommandOutcome::new(
            "coe-analyze",
            if report.is_valid() {
                format!("{}: root-cause analysis is complete", task_id)
            } else {
                format!("{}: {} problem(s) in {}", task_id, report.problems.len(), report.path.display())
            },
        )
        .lines(report.problems.iter().map(|p| format!("  - {}", p)));

        let mut seq = session.seq;
        if validate {
            let valid = report.is_valid();
            let task = session.project.task_mut(task_id)?;
            if task.coe_validated != valid {
                task.coe_validated = valid;
                task.updated_at = chrono::Utc::now();
                session.log(
                    "coe-analyze",
                    &format!("{} coe {}", task_id, if valid { "validated" } else { "invalidated" }),
                );
                seq = session.save(&format!("coe-analyze {}", task_id))?;
            }
            if !valid {
                return Err(ConductorError::Precondition {
                    unmet: report
                        .problems
                        .iter()
                        .map(|p| format!("task {}: {}", task_id, p))
                        .collect(),
                });
            }
        }
        outcome = outcome.for_project(&session.project.id, session.project.phase, seq);
        Ok(outcome.details(&report))
    }

    /// Close a task: either defer it with a reason, or record its evidence
    /// and verification and mark it fixed once nothing is missing.
    pub async fn remediate_done(&self, task_id: &str, defer: bool, reason: Option<&str>) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Execute)?;
        let task_dir = remediation::task_dir(session.dir(), task_id);
        if session.project.task(task_id)?.status.is_resolved() {
            let task = session.project.task(task_id)?;
            return Ok(CommandOutcome::new(
                "remediate-done",
                format!("{} is already {}", task_id, task.status),
            )
            .for_project(&session.project.id, session.project.phase, session.seq));
        }

        if defer {
            let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) else {
                return Err(ConductorError::precondition("--defer requires --reason"));
            };
            session.project.task_mut(task_id)?.defer(reason);
            session.log("remediate-done", &format!("deferred {}: {}", task_id, reason));
            let seq = session.save(&format!("remediate-done: defer {}", task_id))?;
            return Ok(CommandOutcome::new("remediate-done", format!("deferred {}", task_id))
                .for_project(&session.project.id, session.project.phase, seq));
        }

        let healing = &self.config.toml.healing;
        let record = remediation::verify_task(
            &self.config.root_dir,
            &task_dir,
            healing.verify_command.as_deref(),
            self.config.attempt_timeout(),
        )
        .await?;

        let task = session.project.task_mut(task_id)?;
        task.evidence_recorded = remediation::has_evidence(&task_dir);
        task.verification = Some(record.clone());
        task.updated_at = chrono::Utc::now();
        let blockers = task.fix_blockers();
        if blockers.is_empty() {
            task.set_status(TaskStatus::Fixed);
        }

        let message = if blockers.is_empty() {
            format!("{} fixed ({})", task_id, record.method)
        } else {
            format!("{} not fixed: {} item(s) missing", task_id, blockers.len())
        };
        session.log("remediate-done", &message);
        let seq = session.save(&format!("remediate-done {}", task_id))?;
        tracing::info!(task = task_id, passed = record.passed, seq, "{}", message);

        if !blockers.is_empty() {
            return Err(ConductorError::Precondition { unmet: blockers });
        }
        let mut outcome = CommandOutcome::new("remediate-done", message)
            .for_project(&session.project.id, session.project.phase, seq)
            .details(&record);
        let has_pattern = session
            .project
            .task(task_id)
            .is_ok_and(|t| t.pattern.is_some());
        if has_pattern {
            outcome = outcome.line(format!("next: conductor pattern-sweep --task {}", task_id));
        }
        Ok(outcome)
    }

    /// Re-check fixed tasks against disk and leave `execute`.
    pub fn remediate_verify(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Execute)?;
        let dir = session.dir().to_path_buf();
        for task in session.project.tasks.values_mut() {
            if task.status == TaskStatus::Fixed {
                task.evidence_recorded = remediation::has_evidence(&remediation::task_dir(&dir, &task.id));
            }
        }

        let fixed = session.project.count_tasks(TaskStatus::Fixed);
        let deferred = session.project.count_tasks(TaskStatus::Deferred);
        let transition = self.advance(&mut session, "remediate-verify", None)?;
        Ok(transition
            .outcome("remediate-verify", &session.project.id)
            .line(format!("{} fixed, {} deferred", fixed, deferred))
            .line(format!(
                "next: write {} and run 'conductor finalize'",
                crate::artifacts::VALIDATION
            )))
    }

    /// Search the working tree for other sites of a task's pattern.
    pub fn pattern_sweep(&self, task_id: &str) -> Result<CommandOutcome> {
        let session = self.open_session()?;
        session.project.ensure_mutable()?;
        let task = session.project.task(task_id)?;
        let result = sweep::sweep(&self.config.root_dir, task)?;
        sweep::save(&remediation::task_dir(session.dir(), task_id), &result)?;

        let new_sites: Vec<_> = result.new_sites().collect();
        let message = format!(
            "{}: {} match(es) in {} file(s) scanned, {} new site(s)",
            task_id,
            result.matches.len(),
            result.files_scanned,
            new_sites.len()
        );
        session.log_and_refresh("pattern-sweep", &message);

        let mut warnings = Vec::new();
        if task.status != TaskStatus::Fixed {
            warnings.push(format!("task {} is {}, not fixed", task_id, task.status));
        }
        if result.truncated {
            warnings.push(format!("stopped after {} matches", sweep::MAX_MATCHES));
        }
        Ok(CommandOutcome::new("pattern-sweep", message)
            .for_project(&session.project.id, session.project.phase, session.seq)
            .lines(
                new_sites
                    .iter()
                    .map(|m| format!("  {}:{}: {}", m.file, m.line, m.text)),
            )
            .warnings(warnings)
            .details(&result))
    }
}
