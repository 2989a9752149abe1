//! Per-project advisory lock.
//!
//! The lock file `<project>/.lock` persists between runs; holding the lock
//! means holding an exclusive `flock` on it. The holder writes its pid into
//! the file so a contender can report who is in the way. The OS drops the
//! lock when the holder exits, so a crashed holder never leaves a stale lock.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::errors::{ConductorError, Result};

pub const LOCK_FILE: &str = ".lock";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Contents of the lock file while held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A held project lock. Released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
    project_id: String,
}

impl ProjectLock {
    /// Acquire the lock for `project_id` in `project_dir`, polling until
    /// `timeout` elapses.
    pub fn acquire(project_dir: &Path, project_id: &str, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(project_dir).map_err(|e| {
            anyhow::Error::new(e).context(format!(
                "Failed to create project directory {}",
                project_dir.display()
            ))
        })?;
        let path = project_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                anyhow::Error::new(e).context(format!("Failed to open lock file {}", path.display()))
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(_) => {
                    let pid = read_holder(&path).map(|h| h.pid).unwrap_or(0);
                    tracing::warn!(project = project_id, pid, "Project lock wait timed out");
                    return Err(ConductorError::Locked {
                        project_id: project_id.to_string(),
                        pid,
                    });
                }
            }
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&holder).map_err(anyhow::Error::new)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&json))
            .and_then(|_| file.sync_data())
            .map_err(|e| anyhow::Error::new(e).context("Failed to record lock holder"))?;

        tracing::debug!(project = project_id, "Acquired project lock");
        Ok(Self {
            file,
            path,
            project_id: project_id.to_string(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Read the last recorded holder, if the file parses.
pub fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}
