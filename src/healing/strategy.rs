//! Strategy tiers and the seams the healing engine drives.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::signature::Failure;

/// Escalation tiers, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyTier {
    /// Formatting and lint autofix.
    Format = 1,
    /// Import and dependency resolution.
    Imports = 2,
    /// Fix using the surrounding code as context.
    Contextual = 3,
    /// Fix aimed at the failing location.
    Targeted = 4,
    /// Expensive whole-problem analysis.
    Deep = 5,
}

impl StrategyTier {
    pub const ALL: [StrategyTier; 5] = [
        Self::Format,
        Self::Imports,
        Self::Contextual,
        Self::Targeted,
        Self::Deep,
    ];

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Imports => "imports",
            Self::Contextual => "contextual",
            Self::Targeted => "targeted",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "format" | "1" => Ok(Self::Format),
            "imports" | "import" | "2" => Ok(Self::Imports),
            "contextual" | "context" | "3" => Ok(Self::Contextual),
            "targeted" | "4" => Ok(Self::Targeted),
            "deep" | "5" => Ok(Self::Deep),
            _ => anyhow::bail!(
                "Invalid strategy tier '{}'. Valid values: format, imports, contextual, targeted, deep",
                s
            ),
        }
    }
}

/// One thing the engine can try.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Strategy {
    Tier(StrategyTier),
    /// A fix command recalled from memory.
    Command(String),
}

impl Strategy {
    /// Stable key, used for the no-repeat ledger and stored as the memory fix.
    pub fn key(&self) -> String {
        match self {
            Self::Tier(tier) => format!("tier:{}", tier),
            Self::Command(cmd) => format!("cmd:{}", cmd.trim()),
        }
    }

    /// Interpret a stored fix. `tier:<name>` names a tier; anything else is a
    /// command, with or without a `cmd:` prefix.
    pub fn from_fix(fix: &str) -> Self {
        let fix = fix.trim();
        if let Some(name) = fix.strip_prefix("tier:")
            && let Ok(tier) = name.parse()
        {
            return Self::Tier(tier);
        }
        Self::Command(fix.strip_prefix("cmd:").unwrap_or(fix).trim().to_string())
    }

    pub fn tier(&self) -> Option<StrategyTier> {
        match self {
            Self::Tier(tier) => Some(*tier),
            Self::Command(_) => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Result of running a strategy or a verification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub output: String,
}

impl StepOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            timed_out: false,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: false,
            output: output.into(),
        }
    }

    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: true,
            output: output.into(),
        }
    }
}

/// Applies a fix strategy.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    /// Whether this executor can run `strategy`. Unsupported strategies are
    /// skipped without consuming an attempt.
    fn supports(&self, strategy: &Strategy) -> bool;

    async fn apply(&self, strategy: &Strategy, failure: &Failure, signature: &str) -> Result<StepOutcome>;
}

/// Runs local verification after a strategy was applied.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn can_verify(&self, failure: &Failure) -> bool;

    async fn verify(&self, failure: &Failure) -> Result<StepOutcome>;
}

/// Checkpoint access for catastrophic rollback.
pub trait Checkpointer {
    /// Sequence number of the newest checkpoint.
    fn head_seq(&self) -> crate::errors::Result<u64>;

    /// Restore checkpoint `seq` as a new checkpoint; returns the new seq.
    fn rollback_to(&mut self, seq: u64, reason: &str) -> crate::errors::Result<u64>;
}
