//! Durable, checksummed project snapshots.
//!
//! Layout under `.conductor/projects/<id>/`:
//!
//! - `checkpoints/<seq:06>.json`: immutable snapshots, highest seq wins
//! - `checkpoints.log`: one line per save
//! - `state.json`, `STATUS.md`, `tasks/<id>.json`: derived documents,
//!   refreshed after each save and never read back as the source of truth
//!
//! A save writes a temp file, fsyncs and renames it into place, so `load`
//! sees either the complete new checkpoint or none of it. `load` walks from
//! the highest seq downward and returns the first checkpoint that parses and
//! whose checksum validates, marking the result as recovered if it had to
//! skip any.

pub mod lock;

pub use lock::ProjectLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conductor_config::ConductorConfig;
use crate::errors::{ConductorError, Result};
use crate::phase::PhaseId;
use crate::project::Project;
use crate::session::{SessionLog, render_status};
use crate::util::{append_line, read_json, write_atomic, write_json_atomic};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const CHECKPOINT_LOG: &str = "checkpoints.log";
pub const STATE_FILE: &str = "state.json";
pub const STATUS_FILE: &str = "STATUS.md";
pub const CURRENT_FILE: &str = "current.json";

/// Session log lines shown in `STATUS.md`.
const STATUS_LOG_LINES: usize = 20;

/// One immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// Lowercase hex SHA-256 over the canonical JSON of every other field.
    pub checksum: String,
    pub project: Project,
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    seq: u64,
    project_id: &'a str,
    created_at: &'a DateTime<Utc>,
    reason: &'a str,
    project: &'a Project,
}

impl Checkpoint {
    fn new(seq: u64, reason: &str, project: Project) -> anyhow::Result<Self> {
        let mut checkpoint = Self {
            seq,
            project_id: project.id.clone(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            checksum: String::new(),
            project,
        };
        checkpoint.checksum = checkpoint.compute_checksum()?;
        Ok(checkpoint)
    }

    pub fn compute_checksum(&self) -> anyhow::Result<String> {
        let view = ChecksumView {
            seq: self.seq,
            project_id: &self.project_id,
            created_at: &self.created_at,
            reason: &self.reason,
            project: &self.project,
        };
        let canonical = serde_json::to_vec(&view).context("Failed to serialize checkpoint")?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn is_valid(&self) -> bool {
        self.compute_checksum()
            .map(|c| c == self.checksum)
            .unwrap_or(false)
    }
}

/// Marker attached to a load that had to skip corrupt checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recovery {
    pub used_seq: u64,
    pub corrupt_seqs: Vec<u64>,
}

impl std::fmt::Display for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recovered from checkpoint {} (skipped corrupt: {})",
            self.used_seq,
            self.corrupt_seqs
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Result of `load`.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub checkpoint: Checkpoint,
    pub recovery: Option<Recovery>,
}

impl Loaded {
    pub fn project(&self) -> &Project {
        &self.checkpoint.project
    }

    pub fn into_project(self) -> Project {
        self.checkpoint.project
    }
}

/// Per-checkpoint verification status, as reported by `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointEntry {
    pub seq: u64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

/// Machine-readable current-state document (`state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub project_id: String,
    pub seq: u64,
    pub phase: PhaseId,
    pub updated_at: DateTime<Utc>,
    pub project: Project,
}

/// Single-row record naming the project commands act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub project_id: String,
    pub set_at: DateTime<Utc>,
}

/// Reads and writes checkpoints for every project under `.conductor/`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    conductor_dir: PathBuf,
    lock_timeout: Duration,
}

fn parse_seq(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".json")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn corruption(project_id: &str, detail: impl Into<String>) -> ConductorError {
    ConductorError::Corruption {
        project_id: project_id.to_string(),
        detail: detail.into(),
    }
}

impl CheckpointStore {
    pub fn new(conductor_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            conductor_dir: conductor_dir.into(),
            lock_timeout,
        }
    }

    pub fn from_config(config: &ConductorConfig) -> Self {
        Self::new(config.conductor_dir.clone(), config.lock_timeout())
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.conductor_dir.join("projects")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    fn checkpoint_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(CHECKPOINT_DIR)
    }

    fn checkpoint_path(&self, project_id: &str, seq: u64) -> PathBuf {
        self.checkpoint_dir(project_id).join(format!("{:06}.json", seq))
    }

    /// Acquire the project's advisory lock with the configured bounded wait.
    pub fn lock(&self, project_id: &str) -> Result<ProjectLock> {
        ProjectLock::acquire(&self.project_dir(project_id), project_id, self.lock_timeout)
    }

    /// Checkpoint sequence numbers present on disk, ascending. Temp files and
    /// anything else not named `<digits>.json` are ignored.
    pub fn seqs(&self, project_id: &str) -> Result<Vec<u64>> {
        let dir = self.checkpoint_dir(project_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut seqs: Vec<u64> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_seq(&e.file_name().to_string_lossy()))
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Write the first checkpoint of a new project.
    pub fn create(&self, project: &Project) -> Result<Checkpoint> {
        let lock = self.lock(&project.id)?;
        if !self.seqs(&project.id)?.is_empty() {
            return Err(ConductorError::precondition(format!(
                "project '{}' already exists",
                project.id
            )));
        }
        self.save_locked(&lock, project, "init")
    }

    /// Lock, save, unlock.
    pub fn save(&self, project: &Project, reason: &str) -> Result<Checkpoint> {
        let lock = self.lock(&project.id)?;
        self.save_locked(&lock, project, reason)
    }

    /// Save while already holding the project's lock.
    pub fn save_locked(&self, lock: &ProjectLock, project: &Project, reason: &str) -> Result<Checkpoint> {
        if lock.project_id() != project.id {
            return Err(anyhow::anyhow!(
                "lock for '{}' cannot save project '{}'",
                lock.project_id(),
                project.id
            )
            .into());
        }
        let seq = self.seqs(&project.id)?.last().copied().unwrap_or(0) + 1;
        let checkpoint = Checkpoint::new(seq, reason, project.clone())?;
        let path = self.checkpoint_path(&project.id, seq);
        write_json_atomic(&path, &checkpoint)?;

        let log_line = format!(
            "{}|{:06}|{}|{}|{}",
            checkpoint.created_at.to_rfc3339(),
            seq,
            &checkpoint.checksum[..16],
            project.phase,
            reason.replace(['|', '\n'], " ")
        );
        append_line(&self.project_dir(&project.id).join(CHECKPOINT_LOG), &log_line)?;

        if let Err(e) = self.refresh_derived(&checkpoint) {
            tracing::warn!(project = %project.id, seq, "Failed to refresh derived documents: {:#}", e);
        }
        tracing::debug!(project = %project.id, seq, reason, "Checkpoint saved");
        Ok(checkpoint)
    }

    fn refresh_derived(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let project = &checkpoint.project;
        let dir = self.project_dir(&project.id);

        let state = StateDocument {
            project_id: project.id.clone(),
            seq: checkpoint.seq,
            phase: project.phase,
            updated_at: checkpoint.created_at,
            project: project.clone(),
        };
        write_json_atomic(&dir.join(STATE_FILE), &state)?;

        for task in project.tasks.values() {
            write_json_atomic(&dir.join("tasks").join(format!("{}.json", task.id)), task)?;
        }

        let recent = SessionLog::new(&dir).tail(STATUS_LOG_LINES)?;
        let status = render_status(project, checkpoint.seq, &recent);
        write_atomic(&dir.join(STATUS_FILE), status.as_bytes())
    }

    /// Re-render `STATUS.md` from the latest checkpoint, e.g. after a
    /// session log entry that did not change the project.
    pub fn refresh_status(&self, project_id: &str) -> Result<()> {
        let loaded = self.load(project_id)?;
        self.refresh_derived(&loaded.checkpoint)?;
        Ok(())
    }

    /// Read one checkpoint file and validate it.
    pub fn read_checkpoint(&self, project_id: &str, seq: u64) -> std::result::Result<Checkpoint, String> {
        let path = self.checkpoint_path(project_id, seq);
        let content = fs::read(&path).map_err(|e| format!("unreadable: {}", e))?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&content).map_err(|e| format!("unparseable: {}", e))?;
        if checkpoint.seq != seq {
            return Err(format!("file {} claims seq {}", seq, checkpoint.seq));
        }
        if checkpoint.project_id != project_id || checkpoint.project.id != project_id {
            return Err(format!("belongs to project '{}'", checkpoint.project_id));
        }
        if !checkpoint.is_valid() {
            return Err("checksum mismatch".to_string());
        }
        // Fields that default when absent could hide a damaged key; the file
        // must be byte-identical to its own canonical encoding.
        match serde_json::to_vec_pretty(&checkpoint) {
            Ok(canonical) if canonical == content => Ok(checkpoint),
            _ => Err("non-canonical encoding".to_string()),
        }
    }

    /// The newest valid checkpoint, with a recovery marker if newer ones
    /// were corrupt. Does not lock.
    pub fn load(&self, project_id: &str) -> Result<Loaded> {
        let seqs = self.seqs(project_id)?;
        if seqs.is_empty() {
            return Err(corruption(project_id, "no checkpoints found"));
        }

        let mut corrupt = Vec::new();
        for &seq in seqs.iter().rev() {
            match self.read_checkpoint(project_id, seq) {
                Ok(checkpoint) => {
                    let recovery = if corrupt.is_empty() {
                        None
                    } else {
                        tracing::warn!(
                            project = project_id,
                            used = seq,
                            skipped = ?corrupt,
                            "Recovered from older checkpoint"
                        );
                        Some(Recovery {
                            used_seq: seq,
                            corrupt_seqs: corrupt,
                        })
                    };
                    return Ok(Loaded {
                        checkpoint,
                        recovery,
                    });
                }
                Err(problem) => {
                    tracing::warn!(project = project_id, seq, %problem, "Skipping invalid checkpoint");
                    corrupt.push(seq);
                }
            }
        }

        Err(corruption(
            project_id,
            format!("all {} checkpoints failed validation", seqs.len()),
        ))
    }

    /// The newest checksum-valid checkpoint.
    pub fn last_valid(&self, project_id: &str) -> Result<Checkpoint> {
        Ok(self.load(project_id)?.checkpoint)
    }

    /// Every checkpoint with its validation status, ascending.
    pub fn list(&self, project_id: &str) -> Result<Vec<CheckpointEntry>> {
        let entries = self
            .seqs(project_id)?
            .into_iter()
            .map(|seq| match self.read_checkpoint(project_id, seq) {
                Ok(cp) => CheckpointEntry {
                    seq,
                    valid: true,
                    created_at: Some(cp.created_at),
                    reason: Some(cp.reason),
                    phase: Some(cp.project.phase),
                    problem: None,
                },
                Err(problem) => CheckpointEntry {
                    seq,
                    valid: false,
                    created_at: None,
                    reason: None,
                    phase: None,
                    problem: Some(problem),
                },
            })
            .collect();
        Ok(entries)
    }

    /// Re-save the project from checkpoint `seq` as a new, newest checkpoint.
    /// History is never rewritten.
    pub fn restore_locked(&self, lock: &ProjectLock, seq: u64, reason: &str) -> Result<Checkpoint> {
        let project_id = lock.project_id().to_string();
        let old = self
            .read_checkpoint(&project_id, seq)
            .map_err(|problem| {
                ConductorError::precondition(format!("checkpoint {} is not restorable: {}", seq, problem))
            })?;
        self.save_locked(lock, &old.project, &format!("restore {:06}: {}", seq, reason))
    }

    /// Point subsequent commands at `project_id`.
    pub fn set_current(&self, project_id: &str) -> Result<()> {
        let pointer = CurrentPointer {
            project_id: project_id.to_string(),
            set_at: Utc::now(),
        };
        write_json_atomic(&self.conductor_dir.join(CURRENT_FILE), &pointer)?;
        Ok(())
    }

    /// The current project id, read fresh from disk.
    pub fn current(&self) -> Result<Option<String>> {
        let pointer: Option<CurrentPointer> = read_json(&self.conductor_dir.join(CURRENT_FILE))?;
        Ok(pointer.map(|p| p.project_id))
    }

    /// The current project id, or `NoProject`.
    pub fn require_current(&self) -> Result<String> {
        self.current()?.ok_or(ConductorError::NoProject)
    }

    /// Ids of every project with at least one checkpoint, sorted.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        let dir = self.projects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(CHECKPOINT_DIR).is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Read `state.json`, if present and parseable.
    pub fn state_document(&self, project_id: &str) -> Option<StateDocument> {
        read_json(&self.project_dir(project_id).join(STATE_FILE))
            .ok()
            .flatten()
    }
}

/// Path of the project's STATUS.md, for display.
pub fn status_path(project_dir: &Path) -> PathBuf {
    project_dir.join(STATUS_FILE)
}
