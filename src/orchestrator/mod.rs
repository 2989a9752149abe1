//! The phase state machine and the commands that drive it.
//!
//! Every mutating command follows the same shape: take the project lock,
//! load the newest valid checkpoint, do the work, and write exactly one new
//! checkpoint (or none, when a gate blocks). Phase exits all go through
//! [`Conductor::advance`], which evaluates the exit gate, asks for approval
//! in supervised mode, and commits the transition.

pub mod discovery;
pub mod heal;
pub mod outcome;
pub mod remediate;
pub mod session;

pub use outcome::CommandOutcome;
pub use session::Session;

use serde::Serialize;
use serde_json::json;
use std::path::Path;

use crate::artifacts::{self, ArtifactSet, AssignmentsArtifact, DiscoveryArtifact, Slot};
use crate::checkpoint::{CheckpointEntry, CheckpointStore, ProjectLock, Recovery};
use crate::conductor_config::ConductorConfig;
use crate::errors::{ConductorError, Result};
use crate::gates::{self, ApprovalGate, GateDecision, GateInput, GateResult};
use crate::healing::Checkpointer;
use crate::phase::PhaseId;
use crate::project::{FixPolicy, PipelineMode, Project, TransitionKind};
use crate::remediation::{self, TaskId};
use crate::roles::{self, WorkerRole};
use crate::session::SessionLog;
use crate::supervisor::{SweepOptions, SweepReport, Supervisor};
use crate::util::{read_json, write_json_atomic};

/// Operator override for a phase-exit gate.
#[derive(Debug, Clone, Default)]
pub struct GateOverride {
    pub force: bool,
    pub rules: Vec<String>,
    pub reason: Option<String>,
}

/// A committed phase transition.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: PhaseId,
    pub to: PhaseId,
    pub seq: u64,
    pub gate: GateResult,
    /// Tasks raised on entering `execute`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raised: Vec<TaskId>,
}

impl Transition {
    fn outcome(&self, command: &str, project_id: &str) -> CommandOutcome {
        CommandOutcome::new(command, format!("{} -> {}", self.from, self.to))
            .for_project(project_id, self.to, self.seq)
            .warnings(self.gate.warning_messages())
    }
}

pub struct Conductor {
    pub config: ConductorConfig,
    pub store: CheckpointStore,
}

impl Conductor {
    pub fn new(config: ConductorConfig) -> Self {
        let store = CheckpointStore::from_config(&config);
        Self { config, store }
    }

    /// Lock and load the current project.
    pub fn open_session(&self) -> Result<Session<'_>> {
        let id = self.store.require_current()?;
        Session::open(&self.store, &id)
    }

    /// Directory of the current project.
    pub fn current_dir(&self) -> Result<std::path::PathBuf> {
        Ok(self.store.project_dir(&self.store.require_current()?))
    }

    pub fn supervisor(&self, project_dir: &Path) -> Supervisor {
        Supervisor::from_config(&self.config, project_dir)
    }

    /// The sweep run automatically by `init`, `resume` and `finalize`.
    /// Pids in `runtime/` are only checked against the registry.
    pub fn auto_sweep(&self, lock: &ProjectLock, project_dir: &Path, force: bool) -> Result<SweepReport> {
        let supervisor = self.supervisor(project_dir);
        let report = supervisor.sweep_locked(lock, &SweepOptions {
            dry_run: self.config.dry_run(),
            force,
            candidates: Vec::new(),
            observed: supervisor.runtime_pids()?,
        })?;
        tracing::debug!(dir = %project_dir.display(), "{}", report.summary());
        Ok(report)
    }

    fn max_agents_for(&self, project: &Project, artifacts: &ArtifactSet) -> usize {
        match &artifacts.assignments {
            Slot::Present(a) => a.max_agents,
            _ => self.config.max_agents(project.pipeline_mode),
        }
    }

    /// Run the exit gate of the current phase and commit the transition to
    /// the next one. On any blocker nothing is persisted and every unmet
    /// item is returned.
    pub fn advance(
        &self,
        session: &mut Session<'_>,
        command: &str,
        gate_override: Option<&GateOverride>,
    ) -> Result<Transition> {
        session.project.ensure_mutable()?;
        let from = session.project.phase;
        let Some(to) = from.next() else {
            return Err(ConductorError::precondition(format!(
                "phase '{}' has no successor",
                from
            )));
        };

        let artifacts = artifacts::collect(session.dir(), &session.project.assignments);
        let max_agents = self.max_agents_for(&session.project, &artifacts);
        let mut result = gates::evaluate(&GateInput {
            from,
            project: &session.project,
            artifacts: &artifacts,
            max_agents,
        });

        let mut kind = TransitionKind::Advance;
        let mut overridden = Vec::new();
        let mut reason = None;
        if let Some(o) = gate_override {
            let why = o.reason.clone().unwrap_or_default();
            if !o.rules.is_empty() {
                let blocking = result.blocking_rules();
                overridden = o
                    .rules
                    .iter()
                    .filter(|r| blocking.contains(r))
                    .cloned()
                    .collect();
                result = gates::apply_overrides(&result, &o.rules, &why);
            }
            if o.force {
                kind = TransitionKind::Forced;
            }
            reason = o.reason.clone();
        }

        if !result.passed {
            tracing::info!(from = %from, rules = ?result.blocking_rules(), "Gate blocked transition");
            session.log(
                command,
                &format!("blocked leaving {}: {}", from, result.blocking_rules().join(", ")),
            );
            return Err(ConductorError::Precondition {
                unmet: result.blocker_messages(),
            });
        }

        let gate = ApprovalGate::new(self.config.approval(), !self.config.json);
        if gate.check(&result)? == GateDecision::Rejected {
            session.log(command, &format!("transition {} -> {} not approved", from, to));
            return Err(ConductorError::precondition(format!(
                "transition {} -> {} was not approved (use --yes or CONDUCTOR_APPROVAL=autonomous)",
                from, to
            )));
        }

        session.project.transition(
            from,
            to,
            kind,
            result.warning_messages(),
            overridden.clone(),
            reason.clone(),
        )?;

        let raised = if to == PhaseId::Execute {
            let issued = remediation::issued_task_number(session.dir())?;
            remediation::raise_tasks(&mut session.project, &artifacts, issued)
        } else {
            Vec::new()
        };

        let mut message = format!("{} -> {}", from, to);
        if !overridden.is_empty() {
            message.push_str(&format!(
                " (overrode {}: {})",
                overridden.join(", "),
                reason.as_deref().unwrap_or("")
            ));
        }
        if !raised.is_empty() {
            message.push_str(&format!(", raised {} task(s)", raised.len()));
        }
        session.log(command, &message);
        let seq = session.save(&format!("{}: {} -> {}", command, from, to))?;
        tracing::info!(project = %session.project.id, %from, %to, seq, "Phase transition committed");

        Ok(Transition {
            from,
            to,
            seq,
            gate: result,
            raised,
        })
    }

    // =========================================
    // Pipeline commands
    // =========================================

    /// Create a project in `discover` and make it current.
    pub fn init(&self, request: &str, lite: bool, fix_policy: Option<FixPolicy>) -> Result<CommandOutcome> {
        if request.trim().is_empty() {
            return Err(ConductorError::precondition("request text is empty"));
        }
        let mode = if lite {
            PipelineMode::Lite
        } else {
            self.config.toml.pipeline.mode
        };
        let policy = fix_policy.unwrap_or(self.config.fix_policy());
        let previous = self.store.current()?;

        let mut project = Project::new(request.trim(), mode, policy);
        project.start()?;
        let dir = self.store.project_dir(&project.id);
        if let Err(e) = SessionLog::new(&dir).record(project.phase, "init", &format!("created: {}", project.request)) {
            tracing::warn!("Failed to write session log: {:#}", e);
        }
        let checkpoint = self.store.create(&project)?;
        self.store.set_current(&project.id)?;
        tracing::info!(project = %project.id, mode = %mode, policy = %policy, "Project created");

        let sweep_id = previous
            .filter(|id| self.store.project_dir(id).exists())
            .unwrap_or_else(|| project.id.clone());
        let sweep_lock = self.store.lock(&sweep_id)?;
        let sweep = self.auto_sweep(&sweep_lock, &self.store.project_dir(&sweep_id), false)?;

        Ok(CommandOutcome::new("init", format!("created project {}", project.id))
            .for_project(&project.id, project.phase, checkpoint.seq)
            .line(format!("mode: {}, fix policy: {}", mode, policy))
            .line("next: conductor discover")
            .line(sweep.summary())
            .warnings(sweep.warnings.clone())
            .details(&json!({ "project": project, "sweep": sweep })))
    }

    /// Write the discovery artifact and leave `discover`.
    pub fn discover(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Discover)?;
        let artifact = discovery::discover(&session.project.request, &self.config.root_dir);
        write_json_atomic(&session.dir().join(artifacts::DISCOVERY), &artifact)?;

        let transition = self.advance(&mut session, "discover", None)?;
        Ok(transition
            .outcome("discover", &session.project.id)
            .line(format!("requirements: {}", artifact.requirements.len()))
            .lines(artifact.requirements.iter().map(|r| format!("  {}: {}", r.id, r.text)))
            .line(format!("tags: {}", artifact.tags.join(", ")))
            .line(format!("candidate files: {}", artifact.candidate_files.len()))
            .details(&artifact))
    }

    /// Rank roles, write the assignment list, and leave `plan`.
    pub fn select_agents(&self, max: Option<usize>) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Plan)?;
        let discovery: Option<DiscoveryArtifact> =
            read_json(&session.dir().join(artifacts::DISCOVERY)).unwrap_or_default();
        let tags = discovery.map(|d| d.tags).unwrap_or_default();
        let max = max
            .unwrap_or_else(|| self.config.max_agents(session.project.pipeline_mode))
            .clamp(1, WorkerRole::ALL.len());

        let assignments = roles::select(&session.project.request, &tags, max);
        write_json_atomic(
            &session.dir().join(artifacts::ASSIGNMENTS),
            &AssignmentsArtifact {
                generated_at: chrono::Utc::now(),
                max_agents: max,
                assignments: assignments.clone(),
            },
        )?;
        session.project.assignments = assignments.clone();

        let transition = self.advance(&mut session, "select-agents", None)?;
        Ok(transition
            .outcome("select-agents", &session.project.id)
            .lines(assignments.iter().map(|a| {
                format!(
                    "  {} (score {}) -> {}",
                    a.role,
                    a.score,
                    session.dir().join(&a.output).display()
                )
            }))
            .details(&assignments))
    }

    /// Check the worker reports and move into `execute`, raising tasks.
    pub fn synthesize(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Review)?;
        let transition = self.advance(&mut session, "synthesize", None)?;
        let tasks: Vec<_> = transition
            .raised
            .iter()
            .filter_map(|id| session.project.tasks.get(id))
            .collect();
        Ok(transition
            .outcome("synthesize", &session.project.id)
            .lines(tasks.iter().map(|t| {
                format!("  {} [{}] {} {}: {}", t.id, t.status, t.severity, t.role, t.title)
            }))
            .details(&tasks))
    }

    /// Leave `validate` and sweep every registered process.
    pub fn finalize(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_phase(PhaseId::Validate)?;
        let transition = self.advance(&mut session, "finalize", None)?;
        let sweep = self.auto_sweep(session.lock(), session.dir(), true)?;
        session.log_and_refresh("finalize", &sweep.summary());
        Ok(transition
            .outcome("finalize", &session.project.id)
            .line(sweep.summary())
            .warnings(sweep.warnings.clone())
            .details(&json!({ "transition": transition, "sweep": sweep })))
    }

    /// Explicit phase-exit gate with optional operator override.
    pub fn pe_gate(&self, from: PhaseId, to: PhaseId, gate_override: GateOverride) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        session.project.ensure_mutable()?;
        let mut unmet = Vec::new();
        if session.project.phase != from {
            unmet.push(format!(
                "project is in phase '{}', not '{}'",
                session.project.phase, from
            ));
        }
        if from.next() != Some(to) {
            unmet.push(format!("'{}' does not directly follow '{}'", to, from));
        }
        if !gate_override.rules.is_empty() && !gate_override.force {
            unmet.push("--override requires --force".to_string());
        }
        if gate_override.force && gate_override.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
            unmet.push("--force requires --reason".to_string());
        }
        let known = gates::rules_for(from);
        for rule in &gate_override.rules {
            if !known.contains(&rule.as_str()) {
                unmet.push(format!(
                    "unknown rule '{}' for phase '{}' (rules: {})",
                    rule,
                    from,
                    known.join(", ")
                ));
            }
        }
        if !unmet.is_empty() {
            return Err(ConductorError::Precondition { unmet });
        }

        let transition = self.advance(&mut session, "pe-gate", Some(&gate_override))?;
        Ok(transition
            .outcome("pe-gate", &session.project.id)
            .details(&transition))
    }

    /// Reload the newest valid checkpoint, re-persist it once if recovery
    /// was needed, and sweep.
    pub fn resume(&self) -> Result<CommandOutcome> {
        let mut session = self.open_session()?;
        let recovery: Option<Recovery> = session.recovery.clone();
        let mut outcome = match &recovery {
            Some(rec) => {
                let message = rec.to_string();
                session.log("resume", &message);
                let seq = session.save(&format!("resume: {}", message))?;
                tracing::warn!(project = %session.project.id, seq, "{}", message);
                CommandOutcome::new("resume", message)
            }
            None => CommandOutcome::new(
                "resume",
                format!("checkpoint {:06} is intact; nothing to recover", session.seq),
            ),
        };

        let sweep = self.auto_sweep(session.lock(), session.dir(), false)?;
        let project = &session.project;
        outcome = outcome
            .for_project(&project.id, project.phase, session.seq)
            .line(format!("phase: {}", project.phase))
            .line(match project.phase.exit_command() {
                Some(cmd) if !project.is_abandoned() => format!("next: conductor {}", cmd),
                _ => "no further commands apply".to_string(),
            })
            .line(sweep.summary())
            .warnings(project.invariant_violations())
            .warnings(sweep.warnings.clone())
            .details(&json!({
                "recovery": recovery,
                "sweep": sweep,
            }));
        if let Some(abandoned) = &project.abandoned {
            outcome = outcome.line(format!("project was abandoned: {}", abandoned.reason));
        }
        Ok(outcome)
    }

    /// Read-only summary of the current project.
    pub fn status(&self) -> Result<CommandOutcome> {
        let id = self.store.require_current()?;
        let loaded = self.store.load(&id)?;
        let dir = self.store.project_dir(&id);
        let mut project = loaded.project().clone();
        // Read-only preview of the current exit gate.
        let gate = (!project.is_abandoned() && project.phase.next().is_some()).then(|| {
            let artifacts = artifacts::collect(&dir, &project.assignments);
            gates::evaluate(&GateInput {
                from: project.phase,
                project: &project,
                artifacts: &artifacts,
                max_agents: self.max_agents_for(&project, &artifacts),
            })
        });
        if let Some(gate) = gate.as_ref().filter(|g| !g.passed) {
            project.mark_blocked(project.phase, gate.blocking_rules());
        }
        let project = &project;
        let processes = self.supervisor(&dir).status()?;
        let recent = SessionLog::new(&dir).tail(5)?;

        let mut outcome = CommandOutcome::new("status", format!("{} is in phase {}", id, project.phase))
            .for_project(&id, project.phase, loaded.checkpoint.seq)
            .lines(project.phases.iter().map(|p| {
                let mut line = format!("  {} {}", p.status.marker(), p.phase);
                if !p.blocked_by.is_empty() {
                    line.push_str(&format!(" (blocked by: {})", p.blocked_by.join(", ")));
                }
                line
            }));
        if !project.tasks.is_empty() {
            outcome = outcome.line("tasks:").lines(project.tasks.values().map(|t| {
                format!("  {} [{}] {} {}: {}", t.id, t.status, t.severity, t.role, t.title)
            }));
        }
        if !processes.is_empty() {
            outcome = outcome.line("processes:").lines(processes.iter().map(|p| {
                format!(
                    "  {} {} {:?}{}",
                    p.record.pid,
                    p.record.purpose,
                    p.liveness,
                    if p.orphan { " (orphan)" } else { "" }
                )
            }));
        }
        if let Some(gate) = &gate {
            outcome = outcome.line(if gate.passed {
                format!("gate: {} exit is clear", project.phase)
            } else {
                format!("gate: {} blocker(s) before leaving {}", gate.blockers.len(), project.phase)
            });
        }
        if let Some(rec) = &loaded.recovery {
            outcome = outcome.warnings([format!("{}; run 'conductor resume'", rec)]);
        }
        if let Some(cmd) = project.phase.exit_command()
            && !project.is_abandoned()
        {
            outcome = outcome.line(format!("next: conductor {}", cmd));
        }
        Ok(outcome.details(&json!({
            "project": project,
            "recovery": loaded.recovery,
            "gate": gate,
            "processes": processes,
            "recent": recent,
        })))
    }

    /// Record the abandon intent. Later mutating commands refuse to run.
    pub fn abort(&self, reason: &str) -> Result<CommandOutcome> {
        if reason.trim().is_empty() {
            return Err(ConductorError::precondition("--reason is required"));
        }
        let mut session = self.open_session()?;
        if let Some(abandoned) = &session.project.abandoned {
            let message = format!("already abandoned: {}", abandoned.reason);
            return Ok(CommandOutcome::new("abort", message).for_project(
                &session.project.id,
                session.project.phase,
                session.seq,
            ));
        }
        let from = session.project.phase;
        session.project.abandon(reason);
        session.log("abort", reason);
        let seq = session.save(&format!("abort: {}", reason))?;
        tracing::warn!(project = %session.project.id, %from, "Project abandoned");
        Ok(CommandOutcome::new("abort", format!("abandoned during {}", from))
            .for_project(&session.project.id, session.project.phase, seq))
    }

    /// Record an accepted decision.
    pub fn decide(&self, text: &str) -> Result<CommandOutcome> {
        if text.trim().is_empty() {
            return Err(ConductorError::precondition("decision text is empty"));
        }
        let mut session = self.open_session()?;
        session.project.ensure_mutable()?;
        let decision = session.project.add_decision(text.trim()).clone();
        session.log("decide", &format!("{}: {}", decision.id, decision.text));
        let seq = session.save(&format!("decide {}", decision.id))?;
        Ok(CommandOutcome::new("decide", format!("recorded decision {}", decision.id))
            .for_project(&session.project.id, session.project.phase, seq)
            .details(&decision))
    }

    // =========================================
    // Checkpoint commands
    // =========================================

    pub fn checkpoint_list(&self) -> Result<(String, Vec<CheckpointEntry>)> {
        let id = self.store.require_current()?;
        let entries = self.store.list(&id)?;
        Ok((id, entries))
    }

    /// Validate every checkpoint. Fails only when none is valid.
    pub fn checkpoint_verify(&self) -> Result<CommandOutcome> {
        let (id, entries) = self.checkpoint_list()?;
        let valid = entries.iter().filter(|e| e.valid).count();
        if valid == 0 {
            return Err(ConductorError::Corruption {
                project_id: id,
                detail: format!("none of {} checkpoints validate", entries.len()),
            });
        }
        let invalid: Vec<String> = entries
            .iter()
            .filter(|e| !e.valid)
            .map(|e| format!("checkpoint {:06}: {}", e.seq, e.problem.as_deref().unwrap_or("invalid")))
            .collect();
        Ok(CommandOutcome::new(
            "checkpoint verify",
            format!("{} of {} checkpoints valid", valid, entries.len()),
        )
        .warnings(invalid)
        .details(&entries))
    }

    /// Restore checkpoint `seq` as the newest checkpoint.
    pub fn checkpoint_restore(&self, seq: u64, reason: &str) -> Result<CommandOutcome> {
        if reason.trim().is_empty() {
            return Err(ConductorError::precondition("--reason is required"));
        }
        let mut session = self.open_session()?;
        let new_seq = session.rollback_to(seq, reason)?;
        Ok(CommandOutcome::new(
            "checkpoint restore",
            format!("restored checkpoint {:06} as {:06}", seq, new_seq),
        )
        .for_project(&session.project.id, session.project.phase, new_seq))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::conductor_config::{CliOverrides, ConductorConfig};
    use crate::util::write_json_atomic;
    use crate::artifacts::{Finding, Severity, ValidationReport, Verdict, WorkerReport};
    use tempfile::TempDir;

    pub fn conductor(root: &TempDir) -> Conductor {
        let db = root.path().join("memory.db").to_string_lossy().into_owned();
        let config = ConductorConfig::load_with_env(
            root.path().to_path_buf(),
            CliOverrides {
                yes: true,
                json: true,
                ..Default::default()
            },
            move |key| (key == crate::conductor_config::ENV_MEMORY_DB).then(|| db.clone()),
        )
        .unwrap();
        Conductor::new(config)
    }

    /// A clean report for every assigned role, covering every requirement.
    pub fn write_reports(c: &Conductor, findings: &[(WorkerRole, Finding)]) {
        let dir = c.current_dir().unwrap();
        let id = c.store.require_current().unwrap();
        let project = c.store.load(&id).unwrap().into_project();
        let discovery: DiscoveryArtifact =
            read_json(&dir.join(artifacts::DISCOVERY)).unwrap().unwrap();
        let reqs: Vec<&str> = discovery.requirements.iter().map(|r| r.id.as_str()).collect();
        for a in &project.assignments {
            let mut report = WorkerReport::new(a.role.as_str()).covering(a.role.as_str());
            if a.role == WorkerRole::Testing {
                report = report.add_finding(
                    Finding::new("TST-0", Severity::Low, "requirements exercised").with_requirements(&reqs),
                );
            }
            for (role, finding) in findings {
                if *role == a.role {
                    report = report.add_finding(finding.clone());
                }
            }
            write_json_atomic(&dir.join(&a.output), &report).unwrap();
        }
    }

    pub fn write_validation(c: &Conductor, verdict: Verdict) {
        let dir = c.current_dir().unwrap();
        write_json_atomic(
            &dir.join(artifacts::VALIDATION),
            &ValidationReport {
                verdict,
                regressions: vec![],
                notes: String::new(),
            },
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::artifacts::{Finding, Severity, Verdict};
    use crate::checkpoint::CHECKPOINT_DIR;
    use crate::phase::PhaseStatus;
    use std::fs;
    use tempfile::tempdir;

    fn head(c: &Conductor) -> u64 {
        let id = c.store.require_current().unwrap();
        *c.store.seqs(&id).unwrap().last().unwrap()
    }

    // =========================================
    // Happy path
    // =========================================

    #[test]
    fn test_clean_run_reaches_complete() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        c.select_agents(None).unwrap();
        write_reports(&c, &[]);
        let synth = c.synthesize().unwrap();
        assert_eq!(synth.phase, Some(PhaseId::Execute));
        c.remediate_verify().unwrap();
        write_validation(&c, Verdict::Pass);
        let done = c.finalize().unwrap();
        assert_eq!(done.phase, Some(PhaseId::Complete));

        let project = c.store.load(&c.store.require_current().unwrap()).unwrap().into_project();
        assert!(project.phases.iter().all(|p| p.status == PhaseStatus::Done));
        assert!(project.invariant_violations().is_empty());
    }

    #[test]
    fn test_blocked_gate_persists_nothing() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        c.select_agents(None).unwrap();
        let before = head(&c);

        let err = c.synthesize().unwrap_err();
        match err {
            ConductorError::Precondition { unmet } => {
                assert!(unmet.iter().any(|u| u.contains("roles-reported")));
            }
            other => panic!("expected precondition, got {other}"),
        }
        assert_eq!(head(&c), before);
    }

    #[test]
    fn test_exit_command_in_wrong_phase() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        assert!(matches!(c.synthesize(), Err(ConductorError::Precondition { .. })));
        assert!(matches!(c.discover(), Ok(_)));
    }

    #[test]
    fn test_no_project_before_init() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        assert!(matches!(c.status(), Err(ConductorError::NoProject)));
    }

    // =========================================
    // Overrides
    // =========================================

    #[test]
    fn test_override_downgrades_only_named_rule() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        c.select_agents(None).unwrap();

        let only_roles = GateOverride {
            force: true,
            rules: vec!["requirements-covered".into()],
            reason: Some("reviewed by hand".into()),
        };
        let err = c.pe_gate(PhaseId::Review, PhaseId::Execute, only_roles).unwrap_err();
        assert!(matches!(err, ConductorError::Precondition { .. }));

        let both = GateOverride {
            force: true,
            rules: vec!["roles-reported".into(), "requirements-covered".into()],
            reason: Some("workers unavailable".into()),
        };
        let outcome = c.pe_gate(PhaseId::Review, PhaseId::Execute, both).unwrap();
        assert_eq!(outcome.phase, Some(PhaseId::Execute));
        assert!(outcome.warnings.iter().any(|w| w.contains("overridden")));

        let project = c.store.load(&c.store.require_current().unwrap()).unwrap().into_project();
        let last = project.history.last().unwrap();
        assert_eq!(last.kind, TransitionKind::Forced);
        assert!(last.overrides.contains(&"roles-reported".to_string()));
    }

    #[test]
    fn test_pe_gate_validates_arguments() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        let err = c
            .pe_gate(
                PhaseId::Discover,
                PhaseId::Review,
                GateOverride {
                    force: false,
                    rules: vec!["nonsense".into()],
                    reason: None,
                },
            )
            .unwrap_err();
        match err {
            ConductorError::Precondition { unmet } => assert_eq!(unmet.len(), 3),
            other => panic!("unexpected {other}"),
        }
    }

    // =========================================
    // Resume and abort
    // =========================================

    #[test]
    fn test_resume_is_idempotent_after_corruption() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        let id = c.store.require_current().unwrap();
        let corrupt = head(&c);
        let path = c
            .store
            .project_dir(&id)
            .join(CHECKPOINT_DIR)
            .join(format!("{:06}.json", corrupt));
        fs::write(&path, "{ torn").unwrap();

        let first = c.resume().unwrap();
        assert!(first.message.contains(&format!("recovered from checkpoint {}", corrupt - 1)));
        let after_first = head(&c);
        assert_eq!(after_first, corrupt + 1);

        let second = c.resume().unwrap();
        assert!(second.message.contains("nothing to recover"));
        assert_eq!(head(&c), after_first);
        assert_eq!(second.phase, Some(PhaseId::Discover));
    }

    #[test]
    fn test_abort_blocks_mutation() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.abort("requirements changed").unwrap();
        assert!(matches!(c.discover(), Err(ConductorError::Abandoned { .. })));
        assert!(matches!(c.decide("use cookies"), Err(ConductorError::Abandoned { .. })));
        assert!(c.status().is_ok());
        assert!(c.resume().is_ok());
        assert!(c.abort("again").unwrap().message.contains("already abandoned"));
    }

    #[test]
    fn test_checkpoint_restore_and_verify() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        let restored = c.checkpoint_restore(1, "redo discovery").unwrap();
        assert_eq!(restored.phase, Some(PhaseId::Discover));
        assert_eq!(restored.seq, Some(3));
        let verify = c.checkpoint_verify().unwrap();
        assert!(verify.message.starts_with("3 of 3"));
    }

    #[test]
    fn test_tasks_raised_after_restore_get_fresh_ids() {
        let root = tempdir().unwrap();
        let c = conductor(&root);
        c.init("add logout button", false, None).unwrap();
        c.discover().unwrap();
        let review = c.select_agents(None).unwrap().seq.unwrap();
        write_reports(
            &c,
            &[(WorkerRole::Security, Finding::new("SEC-1", Severity::High, "token in localStorage"))],
        );
        c.synthesize().unwrap();
        c.remediate().unwrap();
        let dir = c.current_dir().unwrap();
        assert!(dir.join("tasks/T001/coe.md").exists());
        let id = c.store.require_current().unwrap();
        let first: Vec<String> = c.store.load(&id).unwrap().into_project().tasks.into_keys().collect();

        c.checkpoint_restore(review, "redo review").unwrap();
        c.synthesize().unwrap();

        let second: Vec<String> = c.store.load(&id).unwrap().into_project().tasks.into_keys().collect();
        assert_eq!(second.len(), first.len());
        assert!(second.iter().all(|t| !first.contains(t)), "{first:?} vs {second:?}");
    }
}
