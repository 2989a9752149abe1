//! Process supervisor: a registry of worker processes and a sweep that
//! reclaims orphans.
//!
//! Only pids in `processes.json` are ever signalled. A record whose process
//! died, became a zombie or had its pid reused is dropped without a signal.
//! A live record is an orphan when its owner is gone or its heartbeat is
//! older than `stale_after`; orphans get SIGTERM, a grace period, then
//! SIGKILL.
//!
//! Every registry mutation holds the project's advisory lock from read to
//! write, so concurrent `proc register` calls and sweeps never lose records.

pub mod process;

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::checkpoint::ProjectLock;
use crate::conductor_config::ConductorConfig;
use crate::errors::{ConductorError, Result};
use crate::util::{read_json, write_json_atomic};
use process::{Liveness, Termination};

pub const PROCESSES_FILE: &str = "processes.json";
pub const RUNTIME_DIR: &str = "runtime";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    #[default]
    Worker,
    Verifier,
    Healer,
    Other,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Verifier => "verifier",
            Self::Healer => "healer",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProcessKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worker" | "agent" => Ok(Self::Worker),
            "verifier" | "verify" => Ok(Self::Verifier),
            "healer" | "heal" => Ok(Self::Healer),
            "other" => Ok(Self::Other),
            _ => anyhow::bail!(
                "Invalid process kind '{}'. Valid values: worker, verifier, healer, other",
                s
            ),
        }
    }
}

/// A registered process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub kind: ProcessKind,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// Start time at registration, from procfs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    processes: BTreeMap<u32, ProcessRecord>,
}

/// A record as seen by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub record: ProcessRecord,
    pub liveness: Liveness,
    pub orphan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    pub dry_run: bool,
    /// Terminate every registered live process, orphaned or not.
    pub force: bool,
    /// Pids the caller asked to have terminated.
    pub candidates: Vec<u32>,
    /// Pids found in `runtime/*.pid`. Only checked against the registry.
    pub observed: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepAction {
    pub pid: u32,
    pub purpose: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    /// Records removed because their process is gone.
    pub dropped: Vec<SweepAction>,
    /// Processes signalled (or that would be, on a dry run).
    pub terminated: Vec<SweepAction>,
    /// Live registered processes left alone.
    pub kept: Vec<u32>,
    pub warnings: Vec<String>,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        let verb = if self.dry_run { "would terminate" } else { "terminated" };
        format!(
            "sweep: {} {}, {} dropped, {} kept, {} warning(s)",
            verb,
            self.terminated.len(),
            self.dropped.len(),
            self.kept.len(),
            self.warnings.len()
        )
    }
}

/// Registry and sweeper for one project's processes.
pub struct Supervisor {
    project_dir: PathBuf,
    stale_after: ChronoDuration,
    grace: Duration,
    lock_timeout: Duration,
}

impl Supervisor {
    pub fn new(project_dir: impl Into<PathBuf>, stale_after: ChronoDuration, grace: Duration) -> Self {
        Self {
            project_dir: project_dir.into(),
            stale_after,
            grace,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn from_config(config: &ConductorConfig, project_dir: &Path) -> Self {
        let section = &config.toml.supervisor;
        Self::new(
            project_dir,
            ChronoDuration::seconds(section.stale_after_secs as i64),
            Duration::from_millis(section.term_grace_ms),
        )
        .with_lock_timeout(config.lock_timeout())
    }

    fn registry_path(&self) -> PathBuf {
        self.project_dir.join(PROCESSES_FILE)
    }

    /// Take the project lock guarding `processes.json`.
    fn lock(&self) -> Result<ProjectLock> {
        let project_id = self
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        ProjectLock::acquire(&self.project_dir, &project_id, self.lock_timeout)
    }

    fn load(&self) -> AnyResult<Registry> {
        Ok(read_json(&self.registry_path())?.unwrap_or_default())
    }

    fn save(&self, registry: &Registry) -> AnyResult<()> {
        write_json_atomic(&self.registry_path(), registry)
    }

    /// Register a running process. Re-registering a pid replaces its record.
    pub fn register(
        &self,
        pid: u32,
        kind: ProcessKind,
        purpose: &str,
        owner_pid: Option<u32>,
    ) -> Result<ProcessRecord> {
        if process::is_protected(pid) {
            return Err(ConductorError::precondition(format!("pid {} cannot be supervised", pid)));
        }
        if !process::probe(pid, None).is_alive() {
            return Err(ConductorError::precondition(format!("pid {} is not running", pid)));
        }
        let now = Utc::now();
        let record = ProcessRecord {
            pid,
            kind,
            purpose: purpose.to_string(),
            owner_pid,
            start_ticks: process::start_ticks(pid),
            registered_at: now,
            last_seen: now,
        };
        let _lock = self.lock()?;
        let mut registry = self.load()?;
        registry.processes.insert(pid, record.clone());
        self.save(&registry)?;
        tracing::info!(pid, kind = %kind, purpose, "Registered process");
        Ok(record)
    }

    pub fn heartbeat(&self, pid: u32) -> Result<ProcessRecord> {
        let _lock = self.lock()?;
        let mut registry = self.load()?;
        let record = registry
            .processes
            .get_mut(&pid)
            .ok_or_else(|| ConductorError::precondition(format!("pid {} is not registered", pid)))?;
        record.last_seen = Utc::now();
        let record = record.clone();
        self.save(&registry)?;
        Ok(record)
    }

    /// Remove a record. Returns it if it existed.
    pub fn deregister(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        let _lock = self.lock()?;
        let mut registry = self.load()?;
        let removed = registry.processes.remove(&pid);
        if removed.is_some() {
            self.save(&registry)?;
            tracing::debug!(pid, "Deregistered process");
        }
        Ok(removed)
    }

    fn assess(&self, record: &ProcessRecord, now: DateTime<Utc>) -> ProcessStatus {
        let liveness = process::probe(record.pid, record.start_ticks);
        let mut reason = None;
        if liveness.is_alive() {
            if let Some(owner) = record.owner_pid
                && !process::pid_exists(owner)
            {
                reason = Some(format!("owner {} is gone", owner));
            } else if now - record.last_seen > self.stale_after {
                reason = Some(format!(
                    "no heartbeat since {}",
                    record.last_seen.format("%Y-%m-%d %H:%M:%S")
                ));
            }
        }
        ProcessStatus {
            record: record.clone(),
            liveness,
            orphan: reason.is_some(),
            reason,
        }
    }

    /// Every registered process with its liveness. Read-only.
    pub fn status(&self) -> Result<Vec<ProcessStatus>> {
        let registry = self.load()?;
        let now = Utc::now();
        Ok(registry.processes.values().map(|r| self.assess(r, now)).collect())
    }

    /// Drop dead records and terminate orphans (or everything, with
    /// `force`). Unregistered candidates only produce warnings.
    pub fn sweep(&self, options: &SweepOptions) -> Result<SweepReport> {
        let lock = self.lock()?;
        self.sweep_locked(&lock, options)
    }

    /// [`sweep`](Self::sweep) for a caller that already holds the project
    /// lock, e.g. a command's open session.
    pub fn sweep_locked(&self, lock: &ProjectLock, options: &SweepOptions) -> Result<SweepReport> {
        debug_assert_eq!(lock.path().parent(), Some(self.project_dir.as_path()));
        let mut registry = self.load()?;
        let now = Utc::now();
        let mut report = SweepReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let mut mentioned: Vec<u32> = options.candidates.iter().chain(&options.observed).copied().collect();
        mentioned.sort_unstable();
        mentioned.dedup();
        for pid in mentioned {
            if !registry.processes.contains_key(&pid) {
                let state = if process::pid_exists(pid) { "running" } else { "not running" };
                report
                    .warnings
                    .push(format!("pid {} is not registered ({}); not signalled", pid, state));
            }
        }

        let mut remove = Vec::new();
        for record in registry.processes.values() {
            let status = self.assess(record, now);
            let purpose = record.purpose.clone();

            if !status.liveness.is_alive() {
                let reason = match status.liveness {
                    Liveness::Reused => "pid reused by another process",
                    Liveness::Zombie => "exited (zombie)",
                    _ => "exited",
                };
                report.dropped.push(SweepAction {
                    pid: record.pid,
                    purpose,
                    reason: reason.to_string(),
                    termination: None,
                });
                remove.push(record.pid);
                continue;
            }

            let reason = if options.force {
                Some("forced".to_string())
            } else if options.candidates.contains(&record.pid) {
                Some("requested".to_string())
            } else {
                status.reason
            };
            let Some(reason) = reason else {
                report.kept.push(record.pid);
                continue;
            };

            if options.dry_run {
                report.terminated.push(SweepAction {
                    pid: record.pid,
                    purpose,
                    reason,
                    termination: None,
                });
                continue;
            }

            match process::terminate(record.pid, record.start_ticks, self.grace) {
                Ok(termination) => {
                    tracing::info!(pid = record.pid, ?termination, %reason, "Terminated process");
                    if termination == Termination::Survived {
                        report
                            .warnings
                            .push(format!("pid {} survived SIGKILL", record.pid));
                    } else {
                        remove.push(record.pid);
                    }
                    report.terminated.push(SweepAction {
                        pid: record.pid,
                        purpose,
                        reason,
                        termination: Some(termination),
                    });
                }
                Err(e) => {
                    report
                        .warnings
                        .push(format!("failed to signal pid {}: {}", record.pid, e));
                    report.kept.push(record.pid);
                }
            }
        }

        if !options.dry_run && !remove.is_empty() {
            for pid in remove {
                registry.processes.remove(&pid);
            }
            self.save(&registry)?;
        }
        Ok(report)
    }

    /// Pids written by workers into `runtime/*.pid`. Unparseable files are
    /// skipped with a log line.
    pub fn runtime_pids(&self) -> Result<Vec<u32>> {
        let dir = self.project_dir.join(RUNTIME_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut pids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry.context("Failed to read runtime entry")?.path();
            if path.extension().is_none_or(|e| e != "pid") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match content.trim().parse::<u32>() {
                Ok(pid) => pids.push(pid),
                Err(_) => tracing::warn!(file = %path.display(), "Ignoring malformed pid file"),
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}
