//! Remediation task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::artifacts::{Finding, Severity};
use crate::roles::WorkerRole;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Fixed,
    Deferred,
}

impl TaskStatus {
    /// Fixed or deferred: nothing more will happen to the task.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Fixed | Self::Deferred)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Fixed => "fixed",
            Self::Deferred => "deferred",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a task's local verification step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub passed: bool,
    /// `command: <cmd>` or `evidence`.
    pub method: String,
    #[serde(default)]
    pub output: String,
    pub verified_at: DateTime<Utc>,
}

/// One unit of corrective work raised from a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationTask {
    pub id: TaskId,
    pub finding_id: String,
    pub role: WorkerRole,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub status: TaskStatus,
    /// Whether the fix policy selected this task for remediation.
    pub auto_fix: bool,
    #[serde(default)]
    pub coe_validated: bool,
    #[serde(default)]
    pub evidence_recorded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferral_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemediationTask {
    pub fn from_finding(id: impl Into<String>, role: WorkerRole, finding: &Finding, auto_fix: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            finding_id: finding.id.clone(),
            role,
            severity: finding.severity,
            title: finding.title.clone(),
            detail: finding.detail.clone(),
            pattern: finding.pattern.clone(),
            files: finding.files.clone(),
            status: if auto_fix {
                TaskStatus::Open
            } else {
                TaskStatus::Deferred
            },
            auto_fix,
            coe_validated: false,
            evidence_recorded: false,
            verification: None,
            deferral_reason: if auto_fix {
                None
            } else {
                Some(format!("severity {} is outside the fix policy", finding.severity))
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Everything still preventing this task from being marked fixed.
    pub fn fix_blockers(&self) -> Vec<String> {
        let mut unmet = Vec::new();
        if !self.coe_validated {
            unmet.push(format!("task {}: root-cause analysis (coe.md) not validated", self.id));
        }
        if !self.evidence_recorded {
            unmet.push(format!("task {}: verification evidence (evidence.md) missing or empty", self.id));
        }
        match &self.verification {
            Some(v) if v.passed => {}
            Some(_) => unmet.push(format!("task {}: local verification failed", self.id)),
            None => unmet.push(format!("task {}: local verification has not run", self.id)),
        }
        unmet
    }

    pub fn defer(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Deferred;
        self.deferral_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding() -> Finding {
        Finding::new("SEC-1", Severity::High, "token in localStorage").with_pattern("localStorage")
    }

    #[test]
    fn test_from_finding_auto_fix_is_open() {
        let task = RemediationTask::from_finding("T001", WorkerRole::Security, &finding(), true);
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.pattern.as_deref(), Some("localStorage"));
        assert!(task.deferral_reason.is_none());
    }

    #[test]
    fn test_from_finding_outside_policy_is_deferred() {
        let task = RemediationTask::from_finding("T001", WorkerRole::Security, &finding(), false);
        assert_eq!(task.status, TaskStatus::Deferred);
        assert!(task.deferral_reason.unwrap().contains("high"));
    }

    #[test]
    fn test_fix_blockers_lists_every_missing_piece() {
        let mut task = RemediationTask::from_finding("T001", WorkerRole::Security, &finding(), true);
        assert_eq!(task.fix_blockers().len(), 3);

        task.coe_validated = true;
        task.evidence_recorded = true;
        task.verification = Some(VerificationRecord {
            passed: false,
            method: "evidence".into(),
            output: String::new(),
            verified_at: Utc::now(),
        });
        let blockers = task.fix_blockers();
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].contains("failed"));

        task.verification.as_mut().unwrap().passed = true;
        assert!(task.fix_blockers().is_empty());
    }

    #[test]
    fn test_status_resolution() {
        assert!(TaskStatus::Fixed.is_resolved());
        assert!(TaskStatus::Deferred.is_resolved());
        assert!(!TaskStatus::InProgress.is_resolved());
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }
}
