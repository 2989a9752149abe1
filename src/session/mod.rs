//! Append-only session log and the human-readable status document.
//!
//! `session.log` records one line per command outcome in the format
//! `timestamp|phase|command|message`. It lives beside the checkpoints, not
//! inside them, so restoring an older checkpoint never erases the account of
//! what happened.

pub mod status;

pub use status::render_status;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::phase::PhaseId;
use crate::util::append_line;

pub const SESSION_LOG: &str = "session.log";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub command: String,
    pub message: String,
}

pub struct SessionLog {
    path: PathBuf,
}

fn sanitize(field: &str) -> String {
    field.replace(['|', '\n', '\r'], " ")
}

impl SessionLog {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(SESSION_LOG),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    pub fn record(&self, phase: PhaseId, command: &str, message: &str) -> Result<()> {
        let line = format!(
            "{}|{}|{}|{}",
            Utc::now().to_rfc3339(),
            phase,
            sanitize(command),
            sanitize(message)
        );
        append_line(&self.path, &line).context("Failed to write session log")
    }

    /// Every parseable entry, oldest first. Torn trailing lines are skipped.
    pub fn entries(&self) -> Result<Vec<SessionEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read session log")?;

        let entries = content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.splitn(4, '|').collect();
                if parts.len() != 4 {
                    return None;
                }
                Some(SessionEntry {
                    timestamp: DateTime::parse_from_rfc3339(parts[0])
                        .ok()?
                        .with_timezone(&Utc),
                    phase: parts[1].to_string(),
                    command: parts[2].to_string(),
                    message: parts[3].to_string(),
                })
            })
            .collect();

        Ok(entries)
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<SessionEntry>> {
        let entries = self.entries()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_log() {
        let dir = tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        assert!(log.entries().unwrap().is_empty());
        assert!(log.tail(5).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        log.record(PhaseId::Discover, "discover", "wrote discovery.json").unwrap();
        log.record(PhaseId::Plan, "select-agents", "3 roles | max 5\nassigned").unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, "discover");
        assert_eq!(entries[1].command, "select-agents");
        assert_eq!(entries[1].message, "3 roles   max 5 assigned");
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        log.record(PhaseId::Review, "synthesize", "ok").unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"2026-01-01T00:0"))
            .unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_tail_returns_latest() {
        let dir = tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        for i in 0..5 {
            log.record(PhaseId::Execute, "remediate", &format!("step {i}")).unwrap();
        }
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "step 3");
        assert_eq!(tail[1].message, "step 4");
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            SessionLog::new(dir.path())
                .record(PhaseId::Init, "init", "created")
                .unwrap();
        }
        let entries = SessionLog::new(dir.path()).entries().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
