//! Persistent healing state under `<project>/healing/`.
//!
//! - `attempts.jsonl`: one [`HealingAttempt`] per line, append-only
//! - `pattern-index.json`: per-signature ledger plus the failure streak
//! - `deferred/<signature>.json`: terminal [`DeferredRecord`]s
//!
//! None of this lives in a checkpoint, so a catastrophic rollback never
//! forgets which strategies already failed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::signature::Failure;
use super::strategy::StrategyTier;
use crate::util::{append_line, read_json, write_json_atomic};

pub const HEALING_DIR: &str = "healing";
pub const ATTEMPTS_FILE: &str = "attempts.jsonl";
pub const INDEX_FILE: &str = "pattern-index.json";
pub const DEFERRED_DIR: &str = "deferred";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Aborted,
}

/// One try at resolving one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub signature: String,
    /// 1-based, increasing per signature across invocations.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<StrategyTier>,
    pub strategy: String,
    pub from_memory: bool,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub diagnostic: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    #[default]
    Active,
    Resolved,
    Systemic,
    Deferred,
}

/// Everything known about one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureLedger {
    pub signature: String,
    /// Normalized failure text.
    pub sample: String,
    pub attempts: u32,
    #[serde(default)]
    pub failed_strategies: Vec<String>,
    /// Distinct tasks this signature was reported on.
    #[serde(default)]
    pub tasks: BTreeSet<String>,
    #[serde(default)]
    pub status: SignatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SignatureLedger {
    pub fn new(signature: &str, sample: &str) -> Self {
        let now = Utc::now();
        Self {
            signature: signature.to_string(),
            sample: sample.to_string(),
            attempts: 0,
            failed_strategies: Vec::new(),
            tasks: BTreeSet::new(),
            status: SignatureStatus::Active,
            resolved_by: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn has_failed(&self, key: &str) -> bool {
        self.failed_strategies.iter().any(|s| s == key)
    }
}

/// Consecutive failed attempts across all signatures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureStreak {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Newest checkpoint before the streak's first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_streak_seq: Option<u64>,
}

impl FailureStreak {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A catastrophic rollback that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub restored_seq: u64,
    pub new_seq: u64,
    pub failures: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternIndex {
    #[serde(default)]
    pub signatures: BTreeMap<String, SignatureLedger>,
    #[serde(default)]
    pub streak: FailureStreak,
    #[serde(default)]
    pub rollbacks: Vec<RollbackRecord>,
}

/// Terminal record for a signature healing could not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRecord {
    pub signature: String,
    pub failure: Failure,
    pub normalized: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub attempts: Vec<HealingAttempt>,
    pub recommendations: Vec<String>,
    pub deferred_at: DateTime<Utc>,
}

/// File access for one project's healing state.
pub struct HealingLedger {
    dir: PathBuf,
}

impl HealingLedger {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            dir: project_dir.join(HEALING_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_index(&self) -> Result<PatternIndex> {
        Ok(read_json(&self.dir.join(INDEX_FILE))?.unwrap_or_default())
    }

    pub fn save_index(&self, index: &PatternIndex) -> Result<()> {
        write_json_atomic(&self.dir.join(INDEX_FILE), index)
    }

    pub fn append_attempt(&self, attempt: &HealingAttempt) -> Result<()> {
        let line = serde_json::to_string(attempt).context("Failed to serialize healing attempt")?;
        append_line(&self.dir.join(ATTEMPTS_FILE), &line)
    }

    /// Every logged attempt, optionally for one signature. Torn lines are
    /// skipped.
    pub fn attempts(&self, signature: Option<&str>) -> Result<Vec<HealingAttempt>> {
        let path = self.dir.join(ATTEMPTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<HealingAttempt>(line).ok())
            .filter(|a| signature.is_none_or(|s| a.signature == s))
            .collect())
    }

    pub fn deferred_path(&self, signature: &str) -> PathBuf {
        self.dir.join(DEFERRED_DIR).join(format!("{}.json", signature))
    }

    pub fn write_deferred(&self, record: &DeferredRecord) -> Result<PathBuf> {
        let path = self.deferred_path(&record.signature);
        write_json_atomic(&path, record)?;
        Ok(path)
    }

    pub fn deferred(&self) -> Result<Vec<DeferredRecord>> {
        let dir = self.dir.join(DEFERRED_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(record) = read_json::<DeferredRecord>(&path)?
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.deferred_at.cmp(&b.deferred_at));
        Ok(records)
    }
}
