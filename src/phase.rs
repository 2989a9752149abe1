//! Phase definitions for the conductor pipeline.
//!
//! This module provides:
//! - `PhaseId`, the single canonical phase enumeration with ordinal positions
//! - `PhaseStatus` and `PhaseState` for per-phase bookkeeping inside a project
//! - `CoarsePhase`, the PLAN/EXECUTE/VERIFY view over the same states
//!
//! Phases run in strict ordinal order. `Abandoned` is a terminal reachable
//! from any phase and has no ordinal of its own.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Init,
    Discover,
    Plan,
    Review,
    Execute,
    Validate,
    Complete,
    Abandoned,
}

/// The ordered pipeline, excluding the `Abandoned` terminal.
pub const PIPELINE: [PhaseId; 7] = [
    PhaseId::Init,
    PhaseId::Discover,
    PhaseId::Plan,
    PhaseId::Review,
    PhaseId::Execute,
    PhaseId::Validate,
    PhaseId::Complete,
];

impl PhaseId {
    /// Ordinal position within the pipeline. `Abandoned` has none.
    pub fn ordinal(&self) -> Option<usize> {
        PIPELINE.iter().position(|p| p == self)
    }

    /// The phase that follows this one, if any.
    pub fn next(&self) -> Option<PhaseId> {
        self.ordinal().and_then(|i| PIPELINE.get(i + 1).copied())
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Abandoned)
    }

    /// The command that finishes this phase and moves to the next one.
    pub fn exit_command(&self) -> Option<&'static str> {
        match self {
            Self::Init => None,
            Self::Discover => Some("discover"),
            Self::Plan => Some("select-agents"),
            Self::Review => Some("synthesize"),
            Self::Execute => Some("remediate-verify"),
            Self::Validate => Some("finalize"),
            Self::Complete | Self::Abandoned => None,
        }
    }

    /// Artifacts (relative to the project directory) this phase must leave
    /// behind before it may be marked done.
    pub fn required_artifacts(&self) -> &'static [&'static str] {
        match self {
            Self::Discover => &["artifacts/discover/discovery.json"],
            Self::Plan => &["artifacts/plan/assignments.json"],
            Self::Validate => &["artifacts/validate/validation.json"],
            _ => &[],
        }
    }

    /// The coarse three-stage view of this phase.
    pub fn coarse(&self) -> CoarsePhase {
        match self {
            Self::Init | Self::Discover | Self::Plan | Self::Review => CoarsePhase::Plan,
            Self::Execute => CoarsePhase::Execute,
            Self::Validate | Self::Complete | Self::Abandoned => CoarsePhase::Verify,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Discover => "discover",
            Self::Plan => "plan",
            Self::Review => "review",
            Self::Execute => "execute",
            Self::Validate => "validate",
            Self::Complete => "complete",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "discover" | "discovery" => Ok(Self::Discover),
            "plan" | "select" | "select-agents" => Ok(Self::Plan),
            "review" => Ok(Self::Review),
            "execute" | "remediate" => Ok(Self::Execute),
            "validate" | "verify" => Ok(Self::Validate),
            "complete" | "done" => Ok(Self::Complete),
            "abandoned" => Ok(Self::Abandoned),
            _ => bail!(
                "Invalid phase '{}'. Valid values: init, discover, plan, review, execute, validate, complete",
                s
            ),
        }
    }
}

/// PLAN/EXECUTE/VERIFY naming. Documentation view only; never a second
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoarsePhase {
    Plan,
    Execute,
    Verify,
}

impl fmt::Display for CoarsePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
            Self::Verify => "VERIFY",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Active,
    Blocked,
    Done,
}

impl PhaseStatus {
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::Active => "[>]",
            Self::Blocked => "[!]",
            Self::Done => "[x]",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Bookkeeping for one phase inside a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Rule ids of the blockers that last stopped this phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl PhaseState {
    pub fn pending(phase: PhaseId) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            entered_at: None,
            completed_at: None,
            blocked_by: Vec::new(),
        }
    }
}

/// Fresh phase table for a new project: every pipeline phase pending.
pub fn initial_phase_table() -> Vec<PhaseState> {
    PIPELINE.iter().map(|p| PhaseState::pending(*p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_is_strictly_ordered() {
        for (i, phase) in PIPELINE.iter().enumerate() {
            assert_eq!(phase.ordinal(), Some(i));
        }
        assert_eq!(PhaseId::Abandoned.ordinal(), None);
    }

    #[test]
    fn test_next_walks_the_pipeline() {
        assert_eq!(PhaseId::Init.next(), Some(PhaseId::Discover));
        assert_eq!(PhaseId::Review.next(), Some(PhaseId::Execute));
        assert_eq!(PhaseId::Validate.next(), Some(PhaseId::Complete));
        assert_eq!(PhaseId::Complete.next(), None);
        assert_eq!(PhaseId::Abandoned.next(), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(PhaseId::Complete.is_terminal());
        assert!(PhaseId::Abandoned.is_terminal());
        assert!(!PhaseId::Execute.is_terminal());
    }

    #[test]
    fn test_from_str_accepts_aliases() {
        assert_eq!("select-agents".parse::<PhaseId>().unwrap(), PhaseId::Plan);
        assert_eq!("VERIFY".parse::<PhaseId>().unwrap(), PhaseId::Validate);
        assert_eq!("Review".parse::<PhaseId>().unwrap(), PhaseId::Review);
    }

    #[test]
    fn test_from_str_invalid() {
        let err = "nowhere".parse::<PhaseId>().unwrap_err();
        assert!(err.to_string().contains("Invalid phase"));
    }

    #[test]
    fn test_coarse_view_covers_all_phases() {
        assert_eq!(PhaseId::Discover.coarse(), CoarsePhase::Plan);
        assert_eq!(PhaseId::Review.coarse(), CoarsePhase::Plan);
        assert_eq!(PhaseId::Execute.coarse(), CoarsePhase::Execute);
        assert_eq!(PhaseId::Validate.coarse(), CoarsePhase::Verify);
    }

    #[test]
    fn test_exit_commands() {
        assert_eq!(PhaseId::Plan.exit_command(), Some("select-agents"));
        assert_eq!(PhaseId::Review.exit_command(), Some("synthesize"));
        assert_eq!(PhaseId::Complete.exit_command(), None);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&PhaseId::Execute).unwrap();
        assert_eq!(json, "\"execute\"");
        let state = PhaseState::pending(PhaseId::Plan);
        let json = serde_json::to_string(&state).unwrap();
        let parsed: PhaseState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_initial_phase_table() {
        let table = initial_phase_table();
        assert_eq!(table.len(), PIPELINE.len());
        assert!(table.iter().all(|p| p.status == PhaseStatus::Pending));
    }
}
