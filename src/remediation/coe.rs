//! Correction-of-error documents.
//!
//! Every task gets a `tasks/<id>/coe.md` scaffold. Validation requires each
//! section to contain real text (placeholders stripped) and at least three
//! answered whys.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::task::RemediationTask;
use crate::util::write_atomic;

pub const COE_FILE: &str = "coe.md";

/// Sections a complete analysis must fill in.
pub const REQUIRED_SECTIONS: [&str; 5] = [
    "Summary",
    "Root cause",
    "Five whys",
    "Corrective actions",
    "Prevention",
];

/// Answered whys needed.
pub const MIN_WHYS: usize = 3;

const PLACEHOLDER: &str = "<!-- fill in -->";

#[derive(Debug, Clone, Serialize)]
pub struct CoeReport {
    pub task_id: String,
    pub path: PathBuf,
    /// The scaffold was written by this call.
    pub created: bool,
    pub problems: Vec<String>,
}

impl CoeReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

pub fn coe_path(task_dir: &Path) -> PathBuf {
    task_dir.join(COE_FILE)
}

/// Scaffold text for a task.
pub fn template(task: &RemediationTask) -> String {
    let mut out = format!(
        "# COE: {} {}\n\n- Finding: {} ({})\n- Severity: {}\n",
        task.id, task.title, task.finding_id, task.role, task.severity
    );
    if !task.files.is_empty() {
        out.push_str(&format!("- Files: {}\n", task.files.join(", ")));
    }
    for section in REQUIRED_SECTIONS {
        out.push_str(&format!("\n## {}\n\n", section));
        if section == "Five whys" {
            for n in 1..=MIN_WHYS {
                out.push_str(&format!("{}. Why? {}\n", n, PLACEHOLDER));
            }
        } else {
            out.push_str(PLACEHOLDER);
            out.push('\n');
        }
    }
    out
}

/// Write the scaffold unless the file exists. Returns whether it was written.
pub fn scaffold(task_dir: &Path, task: &RemediationTask) -> Result<bool> {
    let path = coe_path(task_dir);
    if path.exists() {
        return Ok(false);
    }
    write_atomic(&path, template(task).as_bytes())?;
    Ok(true)
}

/// Section bodies keyed by lowercase heading.
fn sections(content: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in content.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            out.push((heading.trim().to_lowercase(), String::new()));
        } else if let Some((_, body)) = out.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    out
}

fn meaningful(text: &str) -> String {
    text.replace(PLACEHOLDER, "").trim().to_string()
}

/// Everything wrong with a COE document. Empty when valid.
pub fn validate(content: &str) -> Vec<String> {
    let sections = sections(content);
    let mut problems = Vec::new();
    for required in REQUIRED_SECTIONS {
        let key = required.to_lowercase();
        let Some((_, body)) = sections.iter().find(|(h, _)| *h == key) else {
            problems.push(format!("section '{}' is missing", required));
            continue;
        };
        if required == "Five whys" {
            let answered = body
                .lines()
                .filter(|l| {
                    let l = l.trim_start();
                    l.starts_with(|c: char| c.is_ascii_digit()) || l.starts_with('-') || l.starts_with('*')
                })
                .filter(|l| {
                    let rest = meaningful(l);
                    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit() || ".-* ".contains(c));
                    !rest.trim_start_matches("Why?").trim().is_empty()
                })
                .count();
            if answered < MIN_WHYS {
                problems.push(format!(
                    "section 'Five whys' has {} answered why(s), need {}",
                    answered, MIN_WHYS
                ));
            }
        } else if meaningful(body).is_empty() {
            problems.push(format!("section '{}' is empty", required));
        }
    }
    problems
}

/// Scaffold if needed, then validate what is on disk.
pub fn analyze(task_dir: &Path, task: &RemediationTask) -> Result<CoeReport> {
    let created = scaffold(task_dir, task)?;
    let path = coe_path(task_dir);
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(CoeReport {
        task_id: task.id.clone(),
        path,
        created,
        problems: validate(&content),
    })
}
