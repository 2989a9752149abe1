//! A locked, loaded project.

use std::path::{Path, PathBuf};

use crate::checkpoint::{CheckpointStore, ProjectLock, Recovery};
use crate::errors::Result;
use crate::healing::Checkpointer;
use crate::project::Project;
use crate::session::SessionLog;

/// Holds the project lock for the lifetime of one mutating command.
///
/// Every change goes through [`Session::save`], which writes a new
/// checkpoint. Dropping a session without saving persists nothing.
pub struct Session<'a> {
    store: &'a CheckpointStore,
    lock: ProjectLock,
    dir: PathBuf,
    pub project: Project,
    /// Checkpoint the in-memory project corresponds to.
    pub seq: u64,
    pub recovery: Option<Recovery>,
}

impl<'a> Session<'a> {
    /// Lock `project_id` and load its newest valid checkpoint.
    pub fn open(store: &'a CheckpointStore, project_id: &str) -> Result<Self> {
        let lock = store.lock(project_id)?;
        let loaded = store.load(project_id)?;
        Ok(Self {
            store,
            lock,
            dir: store.project_dir(project_id),
            seq: loaded.checkpoint.seq,
            recovery: loaded.recovery,
            project: loaded.checkpoint.project,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock(&self) -> &ProjectLock {
        &self.lock
    }

    /// Persist the in-memory project as a new checkpoint.
    pub fn save(&mut self, reason: &str) -> Result<u64> {
        let checkpoint = self.store.save_locked(&self.lock, &self.project, reason)?;
        self.seq = checkpoint.seq;
        Ok(self.seq)
    }

    /// Append to the session log under the current phase. Failures to log
    /// are reported but never fail the command.
    pub fn log(&self, command: &str, message: &str) {
        if let Err(e) = SessionLog::new(&self.dir).record(self.project.phase, command, message) {
            tracing::warn!(project = %self.project.id, "Failed to write session log: {:#}", e);
        }
    }

    /// Log, then re-render STATUS.md so the entry shows up without a new
    /// checkpoint.
    pub fn log_and_refresh(&self, command: &str, message: &str) {
        self.log(command, message);
        if let Err(e) = self.store.refresh_status(&self.project.id) {
            tracing::warn!(project = %self.project.id, "Failed to refresh status: {}", e);
        }
    }
}

impl Checkpointer for Session<'_> {
    fn head_seq(&self) -> Result<u64> {
        Ok(self.seq)
    }

    fn rollback_to(&mut self, seq: u64, reason: &str) -> Result<u64> {
        let checkpoint = self.store.restore_locked(&self.lock, seq, reason)?;
        self.project = checkpoint.project;
        self.seq = checkpoint.seq;
        self.log("rollback", &format!("restored checkpoint {:06} as {:06}: {}", seq, self.seq, reason));
        Ok(self.seq)
    }
}
