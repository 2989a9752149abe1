//! The project record: one pipeline run.
//!
//! A `Project` is owned by the checkpoint store. Commands load a copy,
//! mutate it through the methods here, and hand it back to be saved; every
//! method that changes the phase table keeps the ordering invariant intact.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::artifacts::Severity;
use crate::errors::ConductorError;
use crate::phase::{PhaseId, PhaseState, PhaseStatus, initial_phase_table};
use crate::remediation::task::{RemediationTask, TaskId, TaskStatus};
use crate::roles::{Assignment, tokenize};

/// Execution mode for a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    #[default]
    Full,
    Lite,
}

impl PipelineMode {
    /// Default cap on worker assignments.
    pub fn default_max_agents(&self) -> usize {
        match self {
            Self::Full => 5,
            Self::Lite => 3,
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Lite => write!(f, "lite"),
        }
    }
}

impl FromStr for PipelineMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "lite" | "light" => Ok(Self::Lite),
            _ => bail!("Invalid pipeline mode '{}'. Valid values: full, lite", s),
        }
    }
}

/// Which severities are remediated automatically. The rest are raised as
/// deferred tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixPolicy {
    /// Every severity.
    All,
    /// Critical and high.
    #[default]
    High,
    /// Critical only.
    Critical,
    /// Nothing; every task is deferred.
    None,
}

impl FixPolicy {
    pub fn auto_fixes(&self, severity: Severity) -> bool {
        match self {
            Self::All => true,
            Self::High => severity <= Severity::High,
            Self::Critical => severity == Severity::Critical,
            Self::None => false,
        }
    }
}

impl fmt::Display for FixPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::High => "high",
            Self::Critical => "critical",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FixPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "high" | "critical-high" | "critical+high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            "none" | "off" => Ok(Self::None),
            _ => bail!(
                "Invalid fix policy '{}'. Valid values: all, high, critical, none",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Advance,
    Forced,
    Abort,
}

/// One entry in the phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub from: PhaseId,
    pub to: PhaseId,
    pub at: DateTime<Utc>,
    pub kind: TransitionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Gate rules downgraded by an operator override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// An accepted decision that later findings must not contradict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub text: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Abandonment {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub from_phase: PhaseId,
}

/// One pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub request: String,
    pub created_at: DateTime<Utc>,
    pub phase: PhaseId,
    pub pipeline_mode: PipelineMode,
    pub fix_policy: FixPolicy,
    pub phases: Vec<PhaseState>,
    #[serde(default)]
    pub history: Vec<PhaseHistoryEntry>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, RemediationTask>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned: Option<Abandonment>,
}

/// Build a readable project id: request slug plus a short random suffix.
/// Numeric part of a task id such as `T007`.
pub fn task_number(id: &str) -> Option<u32> {
    id.strip_prefix('T')?.parse().ok()
}

pub fn project_id_for(request: &str) -> String {
    let slug: Vec<String> = tokenize(request).into_iter().take(5).collect();
    let slug = if slug.is_empty() {
        "project".to_string()
    } else {
        slug.join("-")
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", slug, &suffix[..8])
}

impl Project {
    /// A fresh project in `Init`, with every phase pending.
    pub fn new(request: impl Into<String>, mode: PipelineMode, fix_policy: FixPolicy) -> Self {
        let request = request.into();
        Self {
            id: project_id_for(&request),
            request,
            created_at: Utc::now(),
            phase: PhaseId::Init,
            pipeline_mode: mode,
            fix_policy,
            phases: initial_phase_table(),
            history: Vec::new(),
            tasks: BTreeMap::new(),
            decisions: Vec::new(),
            assignments: Vec::new(),
            abandoned: None,
        }
    }

    pub fn phase_state(&self, phase: PhaseId) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    fn phase_state_mut(&mut self, phase: PhaseId) -> Option<&mut PhaseState> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_some()
    }

    /// Fail if the project may no longer be mutated.
    pub fn ensure_mutable(&self) -> std::result::Result<(), ConductorError> {
        if let Some(abandoned) = &self.abandoned {
            return Err(ConductorError::Abandoned {
                project_id: self.id.clone(),
                reason: abandoned.reason.clone(),
            });
        }
        Ok(())
    }

    /// Fail unless the project is currently in `phase`.
    pub fn ensure_phase(&self, phase: PhaseId) -> std::result::Result<(), ConductorError> {
        self.ensure_mutable()?;
        if self.phase != phase {
            return Err(ConductorError::precondition(format!(
                "project is in phase '{}', this command needs '{}'",
                self.phase, phase
            )));
        }
        Ok(())
    }

    /// Move from `Init` straight into `Discover`. Init has no gate.
    pub fn start(&mut self) -> Result<()> {
        self.transition(PhaseId::Init, PhaseId::Discover, TransitionKind::Advance, Vec::new(), Vec::new(), None)
    }

    /// Mark `from` done and `to` active. `to` must directly follow `from`
    /// and `from` must be the current phase.
    pub fn transition(
        &mut self,
        from: PhaseId,
        to: PhaseId,
        kind: TransitionKind,
        warnings: Vec<String>,
        overrides: Vec<String>,
        reason: Option<String>,
    ) -> Result<()> {
        if self.is_abandoned() {
            bail!("project {} is abandoned", self.id);
        }
        if self.phase != from {
            bail!("project is in phase '{}', not '{}'", self.phase, from);
        }
        if from.next() != Some(to) {
            bail!("'{}' does not directly follow '{}'", to, from);
        }

        let now = Utc::now();
        if let Some(state) = self.phase_state_mut(from) {
            state.status = PhaseStatus::Done;
            state.completed_at = Some(now);
            state.blocked_by.clear();
        }
        if let Some(state) = self.phase_state_mut(to) {
            // Complete has no work of its own.
            state.status = if to.is_terminal() {
                PhaseStatus::Done
            } else {
                PhaseStatus::Active
            };
            state.entered_at = Some(now);
            if to.is_terminal() {
                state.completed_at = Some(now);
            }
        }
        self.phase = to;
        self.history.push(PhaseHistoryEntry {
            from,
            to,
            at: now,
            kind,
            warnings,
            overrides,
            reason,
        });
        Ok(())
    }

    /// Record that `phase` is held back by the given gate rules.
    pub fn mark_blocked(&mut self, phase: PhaseId, rules: Vec<String>) {
        if let Some(state) = self.phase_state_mut(phase)
            && state.status != PhaseStatus::Done
        {
            state.status = if rules.is_empty() {
                PhaseStatus::Active
            } else {
                PhaseStatus::Blocked
            };
            state.blocked_by = rules;
        }
    }

    /// Record the abandon intent. Idempotent.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        if self.abandoned.is_some() {
            return;
        }
        let now = Utc::now();
        let reason = reason.into();
        self.history.push(PhaseHistoryEntry {
            from: self.phase,
            to: PhaseId::Abandoned,
            at: now,
            kind: TransitionKind::Abort,
            warnings: Vec::new(),
            overrides: Vec::new(),
            reason: Some(reason.clone()),
        });
        self.abandoned = Some(Abandonment {
            reason,
            at: now,
            from_phase: self.phase,
        });
        self.phase = PhaseId::Abandoned;
    }

    pub fn add_decision(&mut self, text: impl Into<String>) -> &Decision {
        let id = format!("D{}", self.decisions.len() + 1);
        self.decisions.push(Decision {
            id,
            text: text.into(),
            accepted_at: Utc::now(),
        });
        &self.decisions[self.decisions.len() - 1]
    }

    /// The id after both the highest tracked task and `issued`, the highest
    /// number ever handed out (which may belong to a rolled-back timeline).
    pub fn next_task_id(&self, issued: u32) -> TaskId {
        let highest = self
            .tasks
            .keys()
            .filter_map(|id| task_number(id))
            .max()
            .unwrap_or(0)
            .max(issued);
        format!("T{:03}", highest + 1)
    }

    pub fn task(&self, id: &str) -> std::result::Result<&RemediationTask, ConductorError> {
        self.tasks
            .get(id)
            .ok_or_else(|| ConductorError::precondition(format!("unknown task '{}'", id)))
    }

    pub fn task_mut(&mut self, id: &str) -> std::result::Result<&mut RemediationTask, ConductorError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ConductorError::precondition(format!("unknown task '{}'", id)))
    }

    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Violations of the phase ordering invariant. Empty for a healthy record.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut first_not_done: Option<PhaseId> = None;
        for state in &self.phases {
            if state.status != PhaseStatus::Pending
                && let Some(earlier) = first_not_done
            {
                violations.push(format!(
                    "phase '{}' is {} while earlier phase '{}' is not done",
                    state.phase, state.status, earlier
                ));
            }
            if state.status != PhaseStatus::Done && first_not_done.is_none() {
                first_not_done = Some(state.phase);
            }
        }
        let active = self
            .phases
            .iter()
            .filter(|p| matches!(p.status, PhaseStatus::Active | PhaseStatus::Blocked))
            .count();
        if active > 1 {
            violations.push(format!("{} phases are active at once", active));
        }
        violations
    }
}
