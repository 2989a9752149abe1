//! Pattern sweep: find other occurrences of a fixed task's pattern in the
//! working tree.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use super::task::RemediationTask;
use crate::errors::ConductorError;

pub const SWEEP_FILE: &str = "sweep.json";

/// Directories never searched.
pub(crate) const SKIP_DIRS: &[&str] = &[".git", ".conductor", "target", "node_modules", ".venv"];

/// Files larger than this are not read.
const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Stop collecting after this many matches.
pub const MAX_MATCHES: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMatch {
    /// Path relative to the swept root, `/`-separated.
    pub file: String,
    pub line: usize,
    pub text: String,
    /// The file is not one the task already named.
    pub new_site: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub task_id: String,
    pub pattern: String,
    pub files_scanned: usize,
    pub matches: Vec<SweepMatch>,
    pub truncated: bool,
    pub swept_at: DateTime<Utc>,
}

impl SweepResult {
    /// Matches outside the files the task already covered.
    pub fn new_sites(&self) -> impl Iterator<Item = &SweepMatch> {
        self.matches.iter().filter(|m| m.new_site)
    }
}

/// Compile a task pattern. Anything that is not a valid regex is searched
/// literally.
pub fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|_| {
        Regex::new(&regex::escape(pattern)).expect("escaped pattern is a valid regex")
    })
}

pub(crate) fn skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

pub(crate) fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Search `root` for the task's pattern.
pub fn sweep(root: &Path, task: &RemediationTask) -> crate::errors::Result<SweepResult> {
    let Some(pattern) = task.pattern.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Err(ConductorError::precondition(format!(
            "task {} has no pattern to sweep for",
            task.id
        )));
    };
    let re = compile(pattern);

    let mut matches = Vec::new();
    let mut files_scanned = 0;
    let mut truncated = false;

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skipped(e));
    'files: for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        files_scanned += 1;
        let file = relative(root, entry.path());
        let new_site = !task.files.iter().any(|f| f.trim_start_matches("./") == file);
        for (idx, line) in content.lines().enumerate() {
            if !re.is_match(line) {
                continue;
            }
            if matches.len() >= MAX_MATCHES {
                truncated = true;
                break 'files;
            }
            matches.push(SweepMatch {
                file: file.clone(),
                line: idx + 1,
                text: line.trim().chars().take(200).collect(),
                new_site,
            });
        }
    }

    tracing::debug!(task = %task.id, pattern, files_scanned, hits = matches.len(), "Pattern sweep finished");
    Ok(SweepResult {
        task_id: task.id.clone(),
        pattern: pattern.to_string(),
        files_scanned,
        matches,
        truncated,
        swept_at: Utc::now(),
    })
}

/// Persist a sweep result in the task directory.
pub fn save(task_dir: &Path, result: &SweepResult) -> Result<()> {
    crate::util::write_json_atomic(&task_dir.join(SWEEP_FILE), result)
        .with_context(|| format!("Failed to save sweep for task {}", result.task_id))
}
