//! Remediation of review findings.
//!
//! `synthesize` raises one [`RemediationTask`] per finding. Tasks inside the
//! project's fix policy start `open`; the rest are deferred on creation.
//! An open task moves to `in_progress` under `remediate`, and becomes `fixed`
//! only once its COE validates, its evidence file has content and a local
//! verification has passed.

pub mod coe;
pub mod sweep;
pub mod task;

pub use coe::{CoeReport, analyze as analyze_coe};
pub use sweep::{SweepMatch, SweepResult};
pub use task::{RemediationTask, TaskId, TaskStatus, VerificationRecord};

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifacts::ArtifactSet;
use crate::healing::run_shell;
use crate::project::{Project, task_number};
use crate::util::write_atomic;

pub const TASKS_DIR: &str = "tasks";
pub const EVIDENCE_FILE: &str = "evidence.md";

/// Working directory for one task's documents.
pub fn task_dir(project_dir: &Path, task_id: &str) -> PathBuf {
    project_dir.join(TASKS_DIR).join(task_id)
}

/// Highest task number with documents under `tasks/`. The directory is not
/// rolled back, so this covers ids issued before a checkpoint restore.
pub fn issued_task_number(project_dir: &Path) -> Result<u32> {
    let dir = project_dir.join(TASKS_DIR);
    if !dir.exists() {
        return Ok(0);
    }
    let mut highest = 0;
    for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let name = entry.context("Failed to read task entry")?.file_name();
        let name = name.to_string_lossy();
        let id = name.strip_suffix(".json").unwrap_or(&name);
        if let Some(n) = task_number(id) {
            highest = highest.max(n);
        }
    }
    Ok(highest)
}

/// Raise a task for every finding not already tracked. Ids continue after
/// `issued`. Returns the new ids.
pub fn raise_tasks(project: &mut Project, artifacts: &ArtifactSet, issued: u32) -> Vec<TaskId> {
    let policy = project.fix_policy;
    let mut raised = Vec::new();
    for (role, report) in artifacts.parsed_reports() {
        for finding in &report.findings {
            let tracked = project
                .tasks
                .values()
                .any(|t| t.role == *role && t.finding_id == finding.id);
            if tracked {
                continue;
            }
            let id = project.next_task_id(issued);
            let task = RemediationTask::from_finding(
                id.clone(),
                *role,
                finding,
                policy.auto_fixes(finding.severity),
            );
            tracing::debug!(task = %id, finding = %finding.id, role = %role, status = %task.status, "Raised task");
            project.tasks.insert(id.clone(), task);
            raised.push(id);
        }
    }
    raised
}

/// The task `remediate` should work on: anything already in progress, then
/// the most severe open auto-fix task.
pub fn next_task(project: &Project) -> Option<&RemediationTask> {
    project
        .tasks
        .values()
        .filter(|t| t.auto_fix && !t.status.is_resolved())
        .min_by_key(|t| (t.status != TaskStatus::InProgress, t.severity, t.id.clone()))
}

pub fn evidence_template(task: &RemediationTask) -> String {
    format!(
        "# Evidence: {} {}\n\n<!-- Commands run, their output, and before/after behaviour. -->\n",
        task.id, task.title
    )
}

/// Move a task into progress and scaffold its COE and evidence documents.
pub fn start_task(project_dir: &Path, task: &mut RemediationTask) -> Result<PathBuf> {
    let dir = task_dir(project_dir, &task.id);
    coe::scaffold(&dir, task)?;
    let evidence = dir.join(EVIDENCE_FILE);
    if !evidence.exists() {
        write_atomic(&evidence, evidence_template(task).as_bytes())?;
    }
    if task.status == TaskStatus::Open {
        task.set_status(TaskStatus::InProgress);
    }
    Ok(dir)
}

/// Whether `evidence.md` holds anything beyond headings and comments.
pub fn has_evidence(task_dir: &Path) -> bool {
    let Ok(content) = fs::read_to_string(task_dir.join(EVIDENCE_FILE)) else {
        return false;
    };
    let mut body = String::new();
    let mut rest = content.as_str();
    while let Some(start) = rest.find("<!--") {
        body.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                rest = "";
            }
        }
    }
    body.push_str(rest);
    body.lines()
        .map(str::trim)
        .any(|l| !l.is_empty() && !l.starts_with('#'))
}

/// Run the task's local verification. With a command, its exit status
/// decides; without one, recorded evidence does.
pub async fn verify_task(
    root_dir: &Path,
    task_dir: &Path,
    verify_command: Option<&str>,
    limit: Duration,
) -> Result<VerificationRecord> {
    match verify_command.filter(|c| !c.trim().is_empty()) {
        Some(command) => {
            let output = run_shell(command, root_dir, limit, &[])
                .await
                .with_context(|| format!("Failed to run verification: {}", command))?;
            Ok(VerificationRecord {
                passed: output.success(),
                method: format!("command: {}", command),
                output: output.diagnostic(),
                verified_at: Utc::now(),
            })
        }
        None => {
            let passed = has_evidence(task_dir);
            Ok(VerificationRecord {
                passed,
                method: "evidence".to_string(),
                output: if passed {
                    String::new()
                } else {
                    format!("{} is missing or empty", EVIDENCE_FILE)
                },
                verified_at: Utc::now(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Finding, Severity, Slot, WorkerReport};
    use crate::project::{FixPolicy, PipelineMode};
    use crate::roles::WorkerRole;
    use tempfile::tempdir;

    fn artifacts() -> ArtifactSet {
        let mut set = ArtifactSet::empty();
        set.reports.insert(
            WorkerRole::Security,
            Slot::Present(
                WorkerReport::new("security")
                    .add_finding(Finding::new("SEC-1", Severity::High, "token in localStorage"))
                    .add_finding(Finding::new("SEC-2", Severity::Low, "verbose error page")),
            ),
        );
        set.reports.insert(
            WorkerRole::Testing,
            Slot::Present(
                WorkerReport::new("testing")
                    .add_finding(Finding::new("TST-1", Severity::Critical, "no logout test")),
            ),
        );
        set.reports
            .insert(WorkerRole::Performance, Slot::Invalid("bad json".into()));
        set
    }

    fn project() -> Project {
        Project::new("add logout button", PipelineMode::Full, FixPolicy::High)
    }

    // =========================================
    // Raising tasks
    // =========================================

    #[test]
    fn test_raise_tasks_applies_fix_policy() {
        let mut p = project();
        let raised = raise_tasks(&mut p, &artifacts(), 0);
        assert_eq!(raised, vec!["T001", "T002", "T003"]);
        assert_eq!(p.count_tasks(TaskStatus::Open), 2);
        assert_eq!(p.count_tasks(TaskStatus::Deferred), 1);
        let low = p.tasks.values().find(|t| t.finding_id == "SEC-2").unwrap();
        assert!(!low.auto_fix);
    }

    #[test]
    fn test_raise_tasks_skips_ids_issued_before_restore() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(task_dir(dir.path(), "T002")).unwrap();
        fs::write(dir.path().join(TASKS_DIR).join("T004.json"), "{}").unwrap();
        fs::write(dir.path().join(TASKS_DIR).join("notes.txt"), "").unwrap();
        assert_eq!(issued_task_number(dir.path()).unwrap(), 4);

        let mut p = project();
        let raised = raise_tasks(&mut p, &artifacts(), issued_task_number(dir.path()).unwrap());
        assert_eq!(raised, vec!["T005", "T006", "T007"]);
    }

    #[test]
    fn test_issued_task_number_without_tasks_dir() {
        let dir = tempdir().unwrap();
        assert_eq!(issued_task_number(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_raise_tasks_is_idempotent() {
        let mut p = project();
        raise_tasks(&mut p, &artifacts(), 0);
        assert!(raise_tasks(&mut p, &artifacts(), 0).is_empty());
        assert_eq!(p.tasks.len(), 3);
    }

    #[test]
    fn test_next_task_prefers_in_progress_then_severity() {
        let mut p = project();
        raise_tasks(&mut p, &artifacts(), 0);
        assert_eq!(next_task(&p).unwrap().finding_id, "TST-1");

        let sec = p.tasks.values().find(|t| t.finding_id == "SEC-1").unwrap().id.clone();
        p.task_mut(&sec).unwrap().set_status(TaskStatus::InProgress);
        assert_eq!(next_task(&p).unwrap().id, sec);

        for task in p.tasks.values_mut() {
            if task.auto_fix {
                task.set_status(TaskStatus::Fixed);
            }
        }
        assert!(next_task(&p).is_none());
    }

    // =========================================
    // Task documents
    // =========================================

    #[test]
    fn test_start_task_scaffolds_documents() {
        let dir = tempdir().unwrap();
        let mut p = project();
        raise_tasks(&mut p, &artifacts(), 0);
        let task = p.task_mut("T001").unwrap();
        let tdir = start_task(dir.path(), task).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(tdir.join(coe::COE_FILE).exists());
        assert!(tdir.join(EVIDENCE_FILE).exists());
        assert!(!has_evidence(&tdir));

        fs::write(
            tdir.join(EVIDENCE_FILE),
            "# Evidence\n<!-- note -->\nlogout test passes after fix\n",
        )
        .unwrap();
        assert!(has_evidence(&tdir));
    }

    #[tokio::test]
    async fn test_verify_task_with_command_and_evidence() {
        let dir = tempdir().unwrap();
        let tdir = dir.path().join("tasks/T001");
        let limit = Duration::from_secs(5);

        let ok = verify_task(dir.path(), &tdir, Some("true"), limit).await.unwrap();
        assert!(ok.passed);
        assert_eq!(ok.method, "command: true");

        let bad = verify_task(dir.path(), &tdir, Some("exit 1"), limit).await.unwrap();
        assert!(!bad.passed);

        let missing = verify_task(dir.path(), &tdir, None, limit).await.unwrap();
        assert!(!missing.passed);
        assert_eq!(missing.method, "evidence");

        fs::create_dir_all(&tdir).unwrap();
        fs::write(tdir.join(EVIDENCE_FILE), "ran the suite, green\n").unwrap();
        assert!(verify_task(dir.path(), &tdir, None, limit).await.unwrap().passed);
    }
}
