//! Typed error hierarchy for the conductor.
//!
//! `ConductorError` carries the failure taxonomy every command reports:
//! - `Precondition`: a missing artifact or unmet gate; fix and rerun
//! - `TransientWorker`: a worker crashed or timed out; the healer may retry
//! - `Corruption`: no checkpoint validates; operator action required
//! - `Systemic`: the circuit breaker tripped for a failure signature
//! - `Exhausted`: healing attempts ran out; the unit of work is deferred
//!
//! Infrastructure errors (I/O, serialization, SQLite) travel as `anyhow`
//! through the `Other` variant.

use thiserror::Error;

/// Process exit code for a command that completed without blockers.
pub const EXIT_OK: i32 = 0;

/// Errors surfaced to the command layer.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Precondition failed ({} unmet): {}", unmet.len(), unmet.join("; "))]
    Precondition { unmet: Vec<String> },

    #[error("Worker failure: {0}")]
    TransientWorker(String),

    #[error("No valid checkpoint for project {project_id}: {detail}")]
    Corruption { project_id: String, detail: String },

    #[error("Systemic failure: signature {signature} recurred on {occurrences} tasks; remediation halted")]
    Systemic {
        signature: String,
        occurrences: usize,
    },

    #[error("Healing exhausted for signature {signature} after {attempts} attempts; deferred")]
    Exhausted { signature: String, attempts: u32 },

    #[error("Project {project_id} is locked by pid {pid}, retry")]
    Locked { project_id: String, pid: u32 },

    #[error("Project {project_id} was abandoned: {reason}")]
    Abandoned { project_id: String, reason: String },

    #[error("No active project. Run 'conductor init <request>' first")]
    NoProject,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    /// Build a precondition failure from a single message.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            unmet: vec![message.into()],
        }
    }

    /// Process exit code for this error. Every variant is non-zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Precondition { .. } => 2,
            Self::Corruption { .. } => 3,
            Self::Systemic { .. } => 4,
            Self::Exhausted { .. } => 5,
            Self::Locked { .. } => 6,
            Self::Abandoned { .. } => 7,
            Self::NoProject => 2,
            Self::TransientWorker(_) | Self::Other(_) => 1,
        }
    }

    /// Short machine-readable kind, used in `--json` output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition { .. } => "precondition_failure",
            Self::TransientWorker(_) => "transient_worker_failure",
            Self::Corruption { .. } => "corruption_failure",
            Self::Systemic { .. } => "systemic_failure",
            Self::Exhausted { .. } => "exhaustion_failure",
            Self::Locked { .. } => "locked",
            Self::Abandoned { .. } => "abandoned",
            Self::NoProject => "no_project",
            Self::Other(_) => "error",
        }
    }
}

pub type Result<T, E = ConductorError> = std::result::Result<T, E>;
