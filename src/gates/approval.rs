//! Operator approval before a transition is committed.

use anyhow::Result;
use dialoguer::{Select, theme::ColorfulTheme};

use super::GateResult;
use crate::conductor_config::ApprovalMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    Rejected,
}

pub struct ApprovalGate {
    mode: ApprovalMode,
    /// Print the gate summary before prompting.
    show_summary: bool,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode, show_summary: bool) -> Self {
        Self { mode, show_summary }
    }

    /// Decide whether the transition described by `result` may be committed.
    /// Autonomous mode approves without asking; supervised mode prompts when
    /// attached to a terminal and rejects otherwise.
    pub fn check(&self, result: &GateResult) -> Result<GateDecision> {
        let to = result.to.map(|p| p.to_string()).unwrap_or_default();
        if self.mode == ApprovalMode::Autonomous {
            tracing::debug!(from = %result.from, to, "Auto-approved transition");
            return Ok(GateDecision::Approved);
        }

        if !console::user_attended() {
            tracing::warn!(
                from = %result.from,
                "Supervised approval needs a terminal; rerun with --yes or CONDUCTOR_APPROVAL=autonomous"
            );
            return Ok(GateDecision::Rejected);
        }

        if self.show_summary {
            eprintln!(
                "\n{} {} → {}",
                console::style("Transition").bold(),
                result.from,
                to
            );
            for warning in &result.warnings {
                eprintln!("  {} {}", console::style("warning").yellow(), warning);
            }
        }

        let options = &["Yes, commit this transition", "No, leave the phase as it is"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Advance from {} to {}?", result.from, to))
            .items(options)
            .default(0)
            .interact()?;

        Ok(match selection {
            0 => GateDecision::Approved,
            _ => GateDecision::Rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseId;

    fn passing() -> GateResult {
        GateResult {
            from: PhaseId::Plan,
            to: Some(PhaseId::Review),
            blockers: vec![],
            warnings: vec![],
            passed: true,
        }
    }

    #[test]
    fn test_autonomous_approves_without_prompt() {
        let gate = ApprovalGate::new(ApprovalMode::Autonomous, true);
        assert_eq!(gate.check(&passing()).unwrap(), GateDecision::Approved);
    }
}
