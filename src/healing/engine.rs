use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::ledger::*;
use super::signature::Failure;
use super::strategy::{Checkpointer, StepOutcome, Strategy, StrategyExecutor, StrategyTier, Verifier};
use crate::conductor_config::ConductorConfig;
use crate::errors::{ConductorError, Result};
use crate::memory::{MemoryCategory, MemoryStore, NewMemoryRecord};

/// Memory domain for records written by the healer.
pub const MEMORY_DOMAIN: &str = "healing";

/// Hard ceiling on attempts per signature.
pub const MAX_ATTEMPTS_CEILING: u32 = 5;

/// Limits the engine works within.
#[derive(Debug, Clone)]
pub struct HealingPolicy {
    pub max_attempts: u32,
    pub recurrence_threshold: usize,
    pub rollback_failures: u32,
    pub rollback_window: ChronoDuration,
}

impl Default for HealingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_CEILING,
            recurrence_threshold: 3,
            rollback_failures: 3,
            rollback_window: ChronoDuration::seconds(900),
        }
    }
}

impl HealingPolicy {
    pub fn from_config(config: &ConductorConfig) -> Self {
        let healing = &config.toml.healing;
        Self {
            max_attempts: config.max_attempts(),
            recurrence_threshold: healing.recurrence_threshold,
            rollback_failures: healing.rollback_failures,
            rollback_window: ChronoDuration::seconds(healing.rollback_window_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealStatus {
    Healed,
    Deferred,
    Systemic,
}

/// What one `heal` call did.
#[derive(Debug, Clone, Serialize)]
pub struct HealReport {
    pub signature: String,
    pub normalized: String,
    pub status: HealStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Attempts made by this call.
    pub attempts: Vec<HealingAttempt>,
    /// Attempts made for this signature across all calls.
    pub total_attempts: u32,
    /// Strategies skipped because no executor supports them.
    pub skipped: Vec<String>,
    pub rollbacks: Vec<RollbackRecord>,
    /// Distinct tasks the signature has been seen on.
    pub occurrences: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred: Option<DeferredRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_path: Option<PathBuf>,
}

impl HealReport {
    /// The error this report maps to, if it is not a success.
    pub fn as_error(&self) -> Option<ConductorError> {
        match self.status {
            HealStatus::Healed => None,
            HealStatus::Deferred => Some(ConductorError::Exhausted {
                signature: self.signature.clone(),
                attempts: self.total_attempts,
            }),
            HealStatus::Systemic => Some(ConductorError::Systemic {
                signature: self.signature.clone(),
                occurrences: self.occurrences,
            }),
        }
    }
}

/// Drives memory recall, tier escalation, the circuit breaker, catastrophic
/// rollback and deferral for one project.
pub struct HealingEngine<'a> {
    ledger: HealingLedger,
    memory: &'a MemoryStore,
    executor: &'a dyn StrategyExecutor,
    verifier: &'a dyn Verifier,
    policy: HealingPolicy,
}

impl<'a> HealingEngine<'a> {
    pub fn new(
        project_dir: &Path,
        memory: &'a MemoryStore,
        executor: &'a dyn StrategyExecutor,
        verifier: &'a dyn Verifier,
        policy: HealingPolicy,
    ) -> Self {
        Self {
            ledger: HealingLedger::new(project_dir),
            memory,
            executor,
            verifier,
            policy,
        }
    }

    pub fn ledger(&self) -> &HealingLedger {
        &self.ledger
    }

    fn max_attempts(&self) -> u32 {
        self.policy.max_attempts.clamp(1, MAX_ATTEMPTS_CEILING)
    }

    /// Try to resolve `failure`. Returns a report for every terminal outcome;
    /// callers map `Deferred`/`Systemic` to errors after persisting.
    pub async fn heal(
        &self,
        failure: &Failure,
        task_id: Option<&str>,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<HealReport> {
        if failure.error.trim().is_empty() {
            return Err(ConductorError::precondition("failure text is empty"));
        }
        let normalized = failure.normalized();
        let signature = failure.signature();
        let mut index = self.ledger.load_index()?;

        let entry = index
            .signatures
            .entry(signature.clone())
            .or_insert_with(|| SignatureLedger::new(&signature, &normalized));
        entry.last_seen = Utc::now();
        if let Some(task) = task_id {
            entry.tasks.insert(task.to_string());
        }

        let mut report = HealReport {
            signature: signature.clone(),
            normalized: normalized.clone(),
            status: HealStatus::Healed,
            resolved_by: None,
            attempts: Vec::new(),
            total_attempts: entry.attempts,
            skipped: Vec::new(),
            rollbacks: Vec::new(),
            occurrences: entry.tasks.len(),
            deferred: None,
            deferred_path: None,
        };

        match entry.status {
            SignatureStatus::Systemic => {
                self.ledger.save_index(&index)?;
                report.status = HealStatus::Systemic;
                return Ok(report);
            }
            SignatureStatus::Deferred => {
                self.ledger.save_index(&index)?;
                report.status = HealStatus::Deferred;
                report.deferred_path = Some(self.ledger.deferred_path(&signature));
                return Ok(report);
            }
            SignatureStatus::Resolved => entry.status = SignatureStatus::Active,
            SignatureStatus::Active => {}
        }

        if entry.tasks.len() >= self.policy.recurrence_threshold.max(1) && task_id.is_some() {
            entry.status = SignatureStatus::Systemic;
            tracing::warn!(
                signature = %signature,
                tasks = entry.tasks.len(),
                "Circuit breaker tripped; signature is systemic"
            );
            self.ledger.save_index(&index)?;
            self.memory.store(
                NewMemoryRecord::new(
                    MemoryCategory::Failure,
                    MEMORY_DOMAIN,
                    format!("systemic: {}", normalized),
                )
                .with_signature(&signature),
            )?;
            report.status = HealStatus::Systemic;
            return Ok(report);
        }

        if !self.verifier.can_verify(failure) {
            return Err(ConductorError::precondition(
                "no verification command: pass --command or set healing.verify_command",
            ));
        }

        let plan = self.plan(&signature, &normalized, &index.signatures[&signature])?;

        for (strategy, from_memory) in plan {
            let entry = &index.signatures[&signature];
            if entry.attempts >= self.max_attempts() {
                break;
            }
            if !self.executor.supports(&strategy) {
                tracing::debug!(strategy = %strategy, "No executor for strategy, skipping");
                report.skipped.push(strategy.key());
                continue;
            }

            let seq_before = checkpointer.head_seq()?;
            let attempt_no = entry.attempts + 1;
            let started_at = Utc::now();
            let clock = Instant::now();
            tracing::info!(signature = %signature, attempt = attempt_no, strategy = %strategy, "Healing attempt");

            let (outcome, diagnostic) = self.run_attempt(&strategy, failure, &signature).await;
            let attempt = HealingAttempt {
                signature: signature.clone(),
                attempt: attempt_no,
                tier: strategy.tier(),
                strategy: strategy.key(),
                from_memory,
                outcome,
                diagnostic,
                started_at,
                duration_ms: clock.elapsed().as_millis() as u64,
                task_id: task_id.map(String::from),
            };
            self.ledger.append_attempt(&attempt)?;
            report.attempts.push(attempt);

            let entry = index
                .signatures
                .get_mut(&signature)
                .ok_or_else(|| anyhow::anyhow!("signature vanished from index"))?;
            entry.attempts = attempt_no;
            report.total_attempts = attempt_no;

            if outcome == AttemptOutcome::Success {
                entry.status = SignatureStatus::Resolved;
                entry.resolved_by = Some(strategy.key());
                index.streak.reset();
                self.ledger.save_index(&index)?;
                let mut record = NewMemoryRecord::new(MemoryCategory::Success, MEMORY_DOMAIN, &normalized)
                    .with_signature(&signature)
                    .with_fix(strategy.key());
                if let Some(task) = task_id {
                    record = record.with_source(task);
                }
                self.memory.store(record)?;
                tracing::info!(signature = %signature, strategy = %strategy, "Failure healed");
                report.resolved_by = Some(strategy.key());
                return Ok(report);
            }

            entry.failed_strategies.push(strategy.key());
            if let Some(rollback) = self.track_failure(&mut index, started_at, seq_before, checkpointer)? {
                report.rollbacks.push(rollback);
            }
            self.ledger.save_index(&index)?;
        }

        self.defer(failure, task_id, &mut index, report)
    }

    /// Strategies to try, in order: a recalled fix that has not failed
    /// yet, then every tier that has not failed yet.
    fn plan(&self, signature: &str, normalized: &str, entry: &SignatureLedger) -> Result<Vec<(Strategy, bool)>> {
        let mut plan = Vec::new();
        if let Some(recalled) = self.memory.find_fix(signature, normalized)? {
            let strategy = Strategy::from_fix(&recalled.fix);
            if !entry.has_failed(&strategy.key()) {
                tracing::info!(
                    signature,
                    record = recalled.record.id,
                    exact = recalled.exact,
                    "Recalled fix from memory"
                );
                plan.push((strategy, true));
            }
        }
        for tier in StrategyTier::ALL {
            let strategy = Strategy::Tier(tier);
            if entry.has_failed(&strategy.key()) || plan.iter().any(|(s, _)| *s == strategy) {
                continue;
            }
            plan.push((strategy, false));
        }
        Ok(plan)
    }

    async fn run_attempt(&self, strategy: &Strategy, failure: &Failure, signature: &str) -> (AttemptOutcome, String) {
        let applied = match self.executor.apply(strategy, failure, signature).await {
            Ok(step) => step,
            Err(e) => return (AttemptOutcome::Aborted, format!("strategy error: {:#}", e)),
        };
        if !applied.success {
            return (step_outcome(&applied), format!("strategy failed: {}", applied.output));
        }
        match self.verifier.verify(failure).await {
            Ok(verified) if verified.success => (AttemptOutcome::Success, verified.output),
            Ok(verified) => (step_outcome(&verified), format!("verification failed: {}", verified.output)),
            Err(e) => (AttemptOutcome::Aborted, format!("verification error: {:#}", e)),
        }
    }

    /// Count a failed attempt toward the streak; roll back when it is long
    /// enough.
    fn track_failure(
        &self,
        index: &mut PatternIndex,
        started_at: chrono::DateTime<Utc>,
        seq_before: u64,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<Option<RollbackRecord>> {
        let streak = &mut index.streak;
        let expired = streak
            .started_at
            .is_none_or(|t| started_at - t > self.policy.rollback_window);
        if streak.count == 0 || expired {
            streak.count = 0;
            streak.started_at = Some(started_at);
            streak.pre_streak_seq = Some(seq_before);
        }
        streak.count += 1;

        if streak.count < self.policy.rollback_failures.max(1) {
            return Ok(None);
        }
        let failures = streak.count;
        let Some(restore) = streak.pre_streak_seq else {
            streak.reset();
            return Ok(None);
        };
        let new_seq = checkpointer.rollback_to(
            restore,
            &format!("catastrophic rollback after {} consecutive failed attempts", failures),
        )?;
        tracing::warn!(restored = restore, new_seq, failures, "Catastrophic rollback");
        let record = RollbackRecord {
            restored_seq: restore,
            new_seq,
            failures,
            at: Utc::now(),
        };
        index.streak.reset();
        index.rollbacks.push(record.clone());
        Ok(Some(record))
    }

    fn defer(
        &self,
        failure: &Failure,
        task_id: Option<&str>,
        index: &mut PatternIndex,
        mut report: HealReport,
    ) -> Result<HealReport> {
        let signature = report.signature.clone();
        let entry = index
            .signatures
            .get_mut(&signature)
            .ok_or_else(|| anyhow::anyhow!("signature vanished from index"))?;
        entry.status = SignatureStatus::Deferred;
        let total = entry.attempts;

        let record = DeferredRecord {
            signature: signature.clone(),
            failure: failure.clone(),
            normalized: report.normalized.clone(),
            task_id: task_id.map(String::from),
            attempts: self.ledger.attempts(Some(&signature))?,
            recommendations: self.recommendations(failure, &report),
            deferred_at: Utc::now(),
        };
        let path = self.ledger.write_deferred(&record)?;
        self.ledger.save_index(index)?;

        let mut memory = NewMemoryRecord::new(
            MemoryCategory::Failure,
            MEMORY_DOMAIN,
            report.normalized.clone(),
        )
        .with_signature(&signature);
        if let Some(task) = task_id {
            memory = memory.with_source(task);
        }
        self.memory.store(memory)?;

        tracing::warn!(signature = %signature, attempts = total, "Healing exhausted; deferred");
        report.status = HealStatus::Deferred;
        report.total_attempts = total;
        report.deferred = Some(record);
        report.deferred_path = Some(path);
        Ok(report)
    }

    fn recommendations(&self, failure: &Failure, report: &HealReport) -> Vec<String> {
        let mut recs = vec![format!(
            "Fix \"{}\" by hand, then record the fix: conductor memory store --category success --signature {} --fix \"<command>\" \"<what fixed it>\"",
            report.normalized, report.signature
        )];
        if let Some(location) = &failure.location {
            recs.push(format!("Add a regression test that covers {}", location));
        }
        for tier in StrategyTier::ALL {
            if !self.executor.supports(&Strategy::Tier(tier)) {
                recs.push(format!(
                    "Configure [healing.tiers] {} so the healer has a {} strategy",
                    tier, tier
                ));
            }
        }
        recs
    }
}

fn step_outcome(step: &StepOutcome) -> AttemptOutcome {
    if step.timed_out {
        AttemptOutcome::Aborted
    } else {
        AttemptOutcome::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use tempfile::tempdir;

    // =========================================
    // Fakes
    // =========================================

    struct FakeExecutor {
        tiers: Vec<StrategyTier>,
        applied: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn all() -> Self {
            Self::only(&StrategyTier::ALL)
        }

        fn only(tiers: &[StrategyTier]) -> Self {
            Self {
                tiers: tiers.to_vec(),
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StrategyExecutor for FakeExecutor {
        fn supports(&self, strategy: &Strategy) -> bool {
            match strategy {
                Strategy::Tier(t) => self.tiers.contains(t),
                Strategy::Command(_) => true,
            }
        }

        async fn apply(&self, strategy: &Strategy, _: &Failure, _: &str) -> anyhow::Result<StepOutcome> {
            self.applied.lock().unwrap().push(strategy.key());
            Ok(StepOutcome::ok("applied"))
        }
    }

    /// Pops scripted verdicts; fails once the script runs out.
    struct ScriptedVerifier {
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedVerifier {
        fn new(script: &[bool]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
            }
        }

        fn always(pass: bool) -> Self {
            Self::new(&[pass; 32])
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        fn can_verify(&self, _: &Failure) -> bool {
            true
        }

        async fn verify(&self, _: &Failure) -> anyhow::Result<StepOutcome> {
            let pass = self.script.lock().unwrap().pop_front().unwrap_or(false);
            Ok(if pass {
                StepOutcome::ok("tests pass")
            } else {
                StepOutcome::failed("tests fail")
            })
        }
    }

    struct FakeCheckpoints {
        head: u64,
        restored: Vec<u64>,
    }

    impl Checkpointer for FakeCheckpoints {
        fn head_seq(&self) -> Result<u64> {
            Ok(self.head)
        }

        fn rollback_to(&mut self, seq: u64, _reason: &str) -> Result<u64> {
            self.restored.push(seq);
            self.head += 1;
            Ok(self.head)
        }
    }

    fn checkpoints() -> FakeCheckpoints {
        FakeCheckpoints {
            head: 10,
            restored: Vec::new(),
        }
    }

    fn no_rollback() -> HealingPolicy {
        HealingPolicy {
            rollback_failures: 100,
            ..Default::default()
        }
    }

    // =========================================
    // Bounds and ordering
    // =========================================

    #[tokio::test]
    async fn test_exhaustion_is_bounded_and_never_repeats() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::always(false);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());
        let failure = Failure::new("undefined symbol parse_config").at("src/config.rs:10");

        let report = engine.heal(&failure, Some("T001"), &mut checkpoints()).await.unwrap();
        assert_eq!(report.status, HealStatus::Deferred);
        assert_eq!(report.attempts.len(), 5);
        assert_eq!(report.total_attempts, 5);
        let numbers: Vec<u32> = report.attempts.iter().map(|a| a.attempt).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        let keys: HashSet<&str> = report.attempts.iter().map(|a| a.strategy.as_str()).collect();
        assert_eq!(keys.len(), 5);

        let deferred = report.deferred.as_ref().unwrap();
        assert_eq!(deferred.attempts.len(), 5);
        assert!(!deferred.recommendations.is_empty());
        assert!(report.deferred_path.as_ref().unwrap().exists());
        assert!(matches!(report.as_error(), Some(ConductorError::Exhausted { attempts: 5, .. })));

        let failures = memory.query("undefined symbol parse_config", Some(MEMORY_DOMAIN), 10).unwrap();
        assert!(failures.iter().any(|m| m.record.category == MemoryCategory::Failure));

        let again = engine.heal(&failure, Some("T001"), &mut checkpoints()).await.unwrap();
        assert_eq!(again.status, HealStatus::Deferred);
        assert!(again.attempts.is_empty());
        assert_eq!(engine.ledger().attempts(Some(&report.signature)).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unsupported_tiers_do_not_consume_attempts() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::only(&[StrategyTier::Imports, StrategyTier::Deep]);
        let verifier = ScriptedVerifier::new(&[false, true]);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());

        let report = engine
            .heal(&Failure::new("unresolved import foo::bar"), None, &mut checkpoints())
            .await
            .unwrap();
        assert_eq!(report.status, HealStatus::Healed);
        assert_eq!(report.resolved_by.as_deref(), Some("tier:deep"));
        assert_eq!(report.total_attempts, 2);
        assert_eq!(report.skipped, vec!["tier:format", "tier:contextual", "tier:targeted"]);
    }

    #[tokio::test]
    async fn test_running_out_of_strategies_defers_early() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::only(&[StrategyTier::Format]);
        let verifier = ScriptedVerifier::always(false);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());

        let report = engine.heal(&Failure::new("lint failure"), None, &mut checkpoints()).await.unwrap();
        assert_eq!(report.status, HealStatus::Deferred);
        assert_eq!(report.total_attempts, 1);
        let recs = &report.deferred.unwrap().recommendations;
        assert!(recs.iter().any(|r| r.contains("[healing.tiers] deep")));
    }

    // =========================================
    // Memory
    // =========================================

    #[tokio::test]
    async fn test_recalled_fix_is_tried_first_and_success_is_remembered() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let failure = Failure::new("type mismatch in handler");
        memory
            .store(
                NewMemoryRecord::new(MemoryCategory::Success, MEMORY_DOMAIN, failure.normalized())
                    .with_signature(failure.signature())
                    .with_fix("tier:targeted"),
            )
            .unwrap();
        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::always(true);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());

        let report = engine.heal(&failure, None, &mut checkpoints()).await.unwrap();
        assert_eq!(report.status, HealStatus::Healed);
        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].from_memory);
        assert_eq!(report.attempts[0].tier, Some(StrategyTier::Targeted));
        assert_eq!(memory.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recalled_fix_that_already_failed_is_skipped() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let failure = Failure::new("flaky socket test");
        let ledger = HealingLedger::new(dir.path());
        let mut index = PatternIndex::default();
        let mut entry = SignatureLedger::new(&failure.signature(), &failure.normalized());
        entry.attempts = 1;
        entry.failed_strategies.push("tier:targeted".into());
        index.signatures.insert(failure.signature(), entry);
        ledger.save_index(&index).unwrap();
        memory
            .store(
                NewMemoryRecord::new(MemoryCategory::Success, MEMORY_DOMAIN, failure.normalized())
                    .with_signature(failure.signature())
                    .with_fix("tier:targeted"),
            )
            .unwrap();

        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::always(false);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());
        let report = engine.heal(&failure, None, &mut checkpoints()).await.unwrap();

        assert_eq!(report.attempts.len(), 4);
        assert!(report.attempts.iter().all(|a| a.strategy != "tier:targeted" && !a.from_memory));
        assert_eq!(report.attempts[0].attempt, 2);
        assert_eq!(report.total_attempts, 5);
    }

    // =========================================
    // Circuit breaker and rollback
    // =========================================

    #[tokio::test]
    async fn test_circuit_breaker_on_third_task() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::always(true);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, no_rollback());
        let failure = Failure::new("database connection refused");

        let first = engine.heal(&failure, Some("T001"), &mut checkpoints()).await.unwrap();
        assert_eq!(first.status, HealStatus::Healed);
        let second = engine.heal(&failure, Some("T002"), &mut checkpoints()).await.unwrap();
        assert_eq!(second.status, HealStatus::Healed);
        assert!(second.attempts[0].from_memory);

        let third = engine.heal(&failure, Some("T003"), &mut checkpoints()).await.unwrap();
        assert_eq!(third.status, HealStatus::Systemic);
        assert!(third.attempts.is_empty());
        assert!(matches!(third.as_error(), Some(ConductorError::Systemic { occurrences: 3, .. })));

        let later = engine.heal(&failure, Some("T001"), &mut checkpoints()).await.unwrap();
        assert_eq!(later.status, HealStatus::Systemic);
        assert!(later.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_three_consecutive_failures_roll_back_then_continue() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::new(&[false, false, false, true]);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, HealingPolicy::default());
        let mut cps = checkpoints();

        let report = engine
            .heal(&Failure::new("migration 0042 failed"), Some("T004"), &mut cps)
            .await
            .unwrap();
        assert_eq!(cps.restored, vec![10]);
        assert_eq!(report.rollbacks.len(), 1);
        assert_eq!(report.rollbacks[0].restored_seq, 10);
        assert_eq!(report.rollbacks[0].new_seq, 11);
        assert_eq!(report.status, HealStatus::Healed);
        assert_eq!(report.total_attempts, 4);

        let index = engine.ledger().load_index().unwrap();
        assert_eq!(index.streak, FailureStreak::default());
        assert_eq!(index.rollbacks.len(), 1);
    }

    #[tokio::test]
    async fn test_streak_outside_window_restarts() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let ledger = HealingLedger::new(dir.path());
        let mut index = PatternIndex::default();
        index.streak = FailureStreak {
            count: 2,
            started_at: Some(Utc::now() - ChronoDuration::hours(2)),
            pre_streak_seq: Some(1),
        };
        ledger.save_index(&index).unwrap();

        let exec = FakeExecutor::only(&[StrategyTier::Format]);
        let verifier = ScriptedVerifier::always(false);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, HealingPolicy::default());
        let mut cps = checkpoints();
        engine.heal(&Failure::new("stale failure"), None, &mut cps).await.unwrap();

        assert!(cps.restored.is_empty());
        let index = engine.ledger().load_index().unwrap();
        assert_eq!(index.streak.count, 1);
        assert_eq!(index.streak.pre_streak_seq, Some(10));
    }

    #[tokio::test]
    async fn test_empty_failure_is_rejected() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::open_in_memory().unwrap();
        let exec = FakeExecutor::all();
        let verifier = ScriptedVerifier::always(true);
        let engine = HealingEngine::new(dir.path(), &memory, &exec, &verifier, HealingPolicy::default());
        let err = engine.heal(&Failure::new("  "), None, &mut checkpoints()).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
