//! Shell-backed strategy execution and verification.
//!
//! Commands run through `sh -c` in the working directory with a hard
//! timeout. A timed-out child is killed when its handle drops.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::signature::Failure;
use super::strategy::{StepOutcome, Strategy, StrategyExecutor, Verifier};
use crate::conductor_config::TierCommands;

/// Output kept from a command, per stream.
const OUTPUT_LIMIT: usize = 4000;

/// Captured result of one shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Combined, truncated output for diagnostics.
    pub fn diagnostic(&self) -> String {
        let mut text = String::new();
        if self.timed_out {
            text.push_str("timed out");
        } else if let Some(code) = self.exit_code {
            text.push_str(&format!("exit {}", code));
        } else {
            text.push_str("killed by signal");
        }
        for stream in [&self.stdout, &self.stderr] {
            let trimmed = stream.trim();
            if !trimmed.is_empty() {
                text.push('\n');
                text.push_str(truncate(trimmed, OUTPUT_LIMIT));
            }
        }
        text
    }

    fn into_step(self) -> StepOutcome {
        let diagnostic = self.diagnostic();
        if self.timed_out {
            StepOutcome::timeout(diagnostic)
        } else if self.success() {
            StepOutcome::ok(diagnostic)
        } else {
            StepOutcome::failed(diagnostic)
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Run `command` with `sh -c` in `dir`, waiting at most `limit`.
pub async fn run_shell(
    command: &str,
    dir: &Path,
    limit: Duration,
    envs: &[(&str, &str)],
) -> Result<ShellOutput> {
    tracing::debug!(command, dir = %dir.display(), timeout_secs = limit.as_secs(), "Running shell command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(result) => {
            let output = result.with_context(|| format!("Failed to wait for command: {}", command))?;
            Ok(ShellOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            })
        }
        Err(_) => {
            tracing::warn!(command, timeout_secs = limit.as_secs(), "Command timed out");
            Ok(ShellOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            })
        }
    }
}

/// Runs the configured `[healing.tiers]` commands and recalled fix commands.
pub struct ShellStrategyExecutor {
    root_dir: PathBuf,
    tiers: TierCommands,
    timeout: Duration,
}

impl ShellStrategyExecutor {
    pub fn new(root_dir: impl Into<PathBuf>, tiers: TierCommands, timeout: Duration) -> Self {
        Self {
            root_dir: root_dir.into(),
            tiers,
            timeout,
        }
    }

    fn command_for(&self, strategy: &Strategy) -> Option<String> {
        match strategy {
            Strategy::Tier(tier) => self.tiers.command_for(*tier).map(String::from),
            Strategy::Command(cmd) if !cmd.trim().is_empty() => Some(cmd.clone()),
            Strategy::Command(_) => None,
        }
    }
}

#[async_trait]
impl StrategyExecutor for ShellStrategyExecutor {
    fn supports(&self, strategy: &Strategy) -> bool {
        self.command_for(strategy).is_some()
    }

    async fn apply(&self, strategy: &Strategy, failure: &Failure, signature: &str) -> Result<StepOutcome> {
        let Some(command) = self.command_for(strategy) else {
            anyhow::bail!("no command configured for strategy {}", strategy);
        };
        let tier = strategy.tier().map(|t| t.to_string()).unwrap_or_default();
        let envs = [
            ("CONDUCTOR_SIGNATURE", signature),
            ("CONDUCTOR_TIER", tier.as_str()),
            ("CONDUCTOR_ERROR", failure.error.as_str()),
            ("CONDUCTOR_LOCATION", failure.location.as_deref().unwrap_or("")),
        ];
        let output = run_shell(&command, &self.root_dir, self.timeout, &envs).await?;
        Ok(output.into_step())
    }
}

/// Re-runs the failing command, else the configured verify command.
pub struct CommandVerifier {
    root_dir: PathBuf,
    verify_command: Option<String>,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(root_dir: impl Into<PathBuf>, verify_command: Option<String>, timeout: Duration) -> Self {
        Self {
            root_dir: root_dir.into(),
            verify_command: verify_command.filter(|c| !c.trim().is_empty()),
            timeout,
        }
    }

    fn command_for<'a>(&'a self, failure: &'a Failure) -> Option<&'a str> {
        failure
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or(self.verify_command.as_deref())
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    fn can_verify(&self, failure: &Failure) -> bool {
        self.command_for(failure).is_some()
    }

    async fn verify(&self, failure: &Failure) -> Result<StepOutcome> {
        let Some(command) = self.command_for(failure) else {
            anyhow::bail!("no verification command available");
        };
        let output = run_shell(command, &self.root_dir, self.timeout, &[]).await?;
        Ok(output.into_step())
    }
}
