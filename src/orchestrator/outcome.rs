//! Structured command results.

use serde::Serialize;
use serde_json::Value;

use crate::phase::PhaseId;

/// What a command did, printed as text or as JSON with `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseId>,
    /// Checkpoint written (or loaded, for read-only commands).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub message: String,
    /// Human-readable detail lines.
    #[serde(skip)]
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl CommandOutcome {
    pub fn new(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            project_id: None,
            phase: None,
            seq: None,
            message: message.into(),
            lines: Vec::new(),
            warnings: Vec::new(),
            details: Value::Null,
        }
    }

    pub fn for_project(mut self, project_id: &str, phase: PhaseId, seq: u64) -> Self {
        self.project_id = Some(project_id.to_string());
        self.phase = Some(phase);
        self.seq = Some(seq);
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn lines(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.lines.extend(lines);
        self
    }

    pub fn warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Attach machine-readable detail. Serialization failures leave the
    /// details empty.
    pub fn details<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.details = v,
            Err(e) => tracing::warn!(command = %self.command, "Failed to serialize details: {}", e),
        }
        self
    }
}
