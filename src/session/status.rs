//! `STATUS.md` rendering.

use std::fmt::Write;

use super::SessionEntry;
use crate::phase::PhaseStatus;
use crate::project::Project;
use crate::remediation::task::TaskStatus;

/// Render the status document for a project at checkpoint `seq`.
pub fn render_status(project: &Project, seq: u64, recent: &[SessionEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", project.id);
    let _ = writeln!(out);
    let _ = writeln!(out, "> {}", project.request);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "- Phase: **{}** ({})",
        project.phase,
        project.phase.coarse()
    );
    let _ = writeln!(out, "- Mode: {}", project.pipeline_mode);
    let _ = writeln!(out, "- Fix policy: {}", project.fix_policy);
    let _ = writeln!(out, "- Checkpoint: {:06}", seq);
    if let Some(abandoned) = &project.abandoned {
        let _ = writeln!(
            out,
            "- ABANDONED during {}: {}",
            abandoned.from_phase, abandoned.reason
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Phases");
    let _ = writeln!(out);
    for state in &project.phases {
        let mut line = format!("- {} {}", state.status.marker(), state.phase);
        if state.status == PhaseStatus::Blocked && !state.blocked_by.is_empty() {
            let _ = write!(line, " (blocked by: {})", state.blocked_by.join(", "));
        }
        let _ = writeln!(out, "{}", line);
    }
    let _ = writeln!(out);

    if !project.assignments.is_empty() {
        let _ = writeln!(out, "## Assignments");
        let _ = writeln!(out);
        for a in &project.assignments {
            let _ = writeln!(out, "- {} (score {}) -> `{}`", a.role, a.score, a.output);
        }
        let _ = writeln!(out);
    }

    if !project.tasks.is_empty() {
        let _ = writeln!(out, "## Tasks");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} open, {} in progress, {} fixed, {} deferred",
            project.count_tasks(TaskStatus::Open),
            project.count_tasks(TaskStatus::InProgress),
            project.count_tasks(TaskStatus::Fixed),
            project.count_tasks(TaskStatus::Deferred)
        );
        let _ = writeln!(out);
        for task in project.tasks.values() {
            let _ = writeln!(
                out,
                "- [{}] {} {} ({}): {}",
                task.status, task.id, task.severity, task.role, task.title
            );
        }
        let _ = writeln!(out);
    }

    if !project.decisions.is_empty() {
        let _ = writeln!(out, "## Decisions");
        let _ = writeln!(out);
        for d in &project.decisions {
            let _ = writeln!(out, "- {}: {}", d.id, d.text);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Session log");
    let _ = writeln!(out);
    if recent.is_empty() {
        let _ = writeln!(out, "_No entries yet._");
    }
    for entry in recent {
        let _ = writeln!(
            out,
            "- {} [{}] {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.phase,
            entry.command,
            entry.message
        );
    }
    out
}
