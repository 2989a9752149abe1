//! Artifact documents and their collection from a project directory.
//!
//! Collection never fails: a missing or unparseable document is recorded as
//! a [`Slot`] state so the gate evaluator can turn it into a blocker. Absence
//! is never treated as success.

pub mod report;

pub use report::{
    DiscoveryArtifact, Finding, Requirement, Severity, Stance, ValidationReport, Verdict,
    WorkerReport,
};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::roles::{Assignment, WorkerRole};
use crate::util::parse_lenient;

pub const DISCOVERY: &str = "artifacts/discover/discovery.json";
pub const ASSIGNMENTS: &str = "artifacts/plan/assignments.json";
pub const VALIDATION: &str = "artifacts/validate/validation.json";

/// Written by `select-agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentsArtifact {
    pub generated_at: DateTime<Utc>,
    pub max_agents: usize,
    pub assignments: Vec<Assignment>,
}

/// Load state of one expected document.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    Missing,
    Invalid(String),
    Present(T),
}

impl<T> Slot<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            Slot::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Slot::Missing)
    }
}

/// Every artifact the gate rules look at, as found on disk.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub discovery: Slot<DiscoveryArtifact>,
    pub assignments: Slot<AssignmentsArtifact>,
    pub reports: BTreeMap<WorkerRole, Slot<WorkerReport>>,
    pub validation: Slot<ValidationReport>,
}

impl ArtifactSet {
    /// An empty set, as if nothing had been written yet.
    pub fn empty() -> Self {
        Self {
            discovery: Slot::Missing,
            assignments: Slot::Missing,
            reports: BTreeMap::new(),
            validation: Slot::Missing,
        }
    }

    /// Reports that parsed.
    pub fn parsed_reports(&self) -> impl Iterator<Item = (&WorkerRole, &WorkerReport)> {
        self.reports
            .iter()
            .filter_map(|(role, slot)| slot.present().map(|r| (role, r)))
    }
}

fn read_slot<T: DeserializeOwned>(path: &Path) -> Slot<T> {
    if !path.exists() {
        return Slot::Missing;
    }
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Slot::Invalid("empty file".to_string()),
        Ok(content) => match parse_lenient(&content) {
            Ok(value) => Slot::Present(value),
            Err(e) => Slot::Invalid(format!("{:#}", e)),
        },
        Err(e) => Slot::Invalid(e.to_string()),
    }
}

/// Read the report one assignment expects.
pub fn read_report(project_dir: &Path, assignment: &Assignment) -> Slot<WorkerReport> {
    match read_slot::<WorkerReport>(&project_dir.join(&assignment.output)) {
        Slot::Present(report) => match report.role.parse::<WorkerRole>() {
            Ok(role) if role == assignment.role => Slot::Present(report),
            _ => Slot::Invalid(format!(
                "report names role '{}' but was assigned to '{}'",
                report.role, assignment.role
            )),
        },
        other => other,
    }
}

/// Collect every artifact under `project_dir` for the given assignments.
pub fn collect(project_dir: &Path, assignments: &[Assignment]) -> ArtifactSet {
    let reports = assignments
        .iter()
        .map(|a| (a.role, read_report(project_dir, a)))
        .collect();

    ArtifactSet {
        discovery: read_slot(&project_dir.join(DISCOVERY)),
        assignments: read_slot(&project_dir.join(ASSIGNMENTS)),
        reports,
        validation: read_slot(&project_dir.join(VALIDATION)),
    }
}
