//! On-disk artifact documents exchanged with workers.
//!
//! Workers write a [`WorkerReport`] per assigned role; the validator writes a
//! [`ValidationReport`]. The core itself writes the [`DiscoveryArtifact`] and
//! the assignment list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a finding, and therefore of the remediation task raised for it.
///
/// Ordered from most to least severe, so `Critical < Low` under `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "error", alias = "blocker")]
    Critical,
    High,
    #[serde(alias = "warning")]
    Medium,
    #[serde(alias = "info", alias = "note")]
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "error" | "blocker" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" | "warning" => Ok(Self::Medium),
            "low" | "info" | "note" => Ok(Self::Low),
            _ => anyhow::bail!(
                "Invalid severity '{}'. Valid values: critical, high, medium, low",
                s
            ),
        }
    }
}

/// Position a worker takes on a topic. Opposite stances on the same topic
/// from different roles form a contradiction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    #[serde(alias = "support", alias = "accept")]
    Approve,
    #[serde(alias = "oppose")]
    Reject,
}

impl Stance {
    pub fn opposes(&self, other: Stance) -> bool {
        *self != other
    }
}

/// One issue reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    /// Requirement ids (`R1`, `R2`, ...) this finding addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance: Option<Stance>,
    /// Decision ids this finding argues against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contradicts: Vec<String>,
    /// Literal or regex used by the pattern sweep once the task is fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl Finding {
    pub fn new(id: impl Into<String>, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            title: title.into(),
            detail: String::new(),
            requirements: Vec::new(),
            topic: None,
            stance: None,
            contradicts: Vec::new(),
            pattern: None,
            files: Vec::new(),
        }
    }

    pub fn with_requirements(mut self, ids: &[&str]) -> Self {
        self.requirements = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_stance(mut self, topic: impl Into<String>, stance: Stance) -> Self {
        self.topic = Some(topic.into());
        self.stance = Some(stance);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// Complete output from one worker role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub role: String,
    #[serde(default)]
    pub summary: String,
    /// Coverage areas the worker claims to have addressed (`testing`, `security`, ...).
    #[serde(default)]
    pub covers: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl WorkerReport {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            summary: String::new(),
            covers: Vec::new(),
            findings: Vec::new(),
        }
    }

    pub fn add_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn covering(mut self, area: impl Into<String>) -> Self {
        self.covers.push(area.into());
        self
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}

/// A requirement extracted from the request during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub text: String,
}

/// Written by `discover`: what the request asks for and where it may land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryArtifact {
    pub request: String,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub candidate_files: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[serde(alias = "passed")]
    Pass,
    #[serde(alias = "failed")]
    Fail,
}

/// Written by the fresh-context validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub regressions: Vec<String>,
    #[serde(default)]
    pub notes: String,
}
