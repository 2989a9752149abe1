//! Unified configuration for the conductor.
//!
//! Settings live in `.conductor/conductor.toml` and are layered
//! file → environment → CLI into a [`ConductorConfig`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-app"
//!
//! [pipeline]
//! mode = "full"
//! approval = "supervised"
//! fix_policy = "high"
//! max_agents = 5
//!
//! [healing]
//! max_attempts = 5
//! recurrence_threshold = 3
//! rollback_failures = 3
//! rollback_window_secs = 900
//! attempt_timeout_secs = 300
//! verify_command = "cargo test"
//!
//! [healing.tiers]
//! format = "cargo fmt"
//! imports = "cargo fix --allow-dirty"
//!
//! [checkpoint]
//! lock_timeout_ms = 5000
//!
//! [supervisor]
//! stale_after_secs = 3600
//! term_grace_ms = 2000
//!
//! [memory]
//! path = "/var/lib/conductor/memory.db"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::healing::StrategyTier;
use crate::project::{FixPolicy, PipelineMode};

/// Name of the per-directory state folder.
pub const CONDUCTOR_DIR: &str = ".conductor";
/// Name of the config file inside [`CONDUCTOR_DIR`].
pub const CONFIG_FILE: &str = "conductor.toml";

pub const ENV_FIX_POLICY: &str = "CONDUCTOR_FIX_POLICY";
pub const ENV_APPROVAL: &str = "CONDUCTOR_APPROVAL";
pub const ENV_DRY_RUN: &str = "CONDUCTOR_DRY_RUN";
pub const ENV_MEMORY_DB: &str = "CONDUCTOR_MEMORY_DB";

/// How phase transitions are approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Ask the operator before committing a transition.
    #[default]
    Supervised,
    /// Commit transitions directly.
    Autonomous,
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalMode::Supervised => write!(f, "supervised"),
            ApprovalMode::Autonomous => write!(f, "autonomous"),
        }
    }
}

impl FromStr for ApprovalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supervised" | "manual" => Ok(ApprovalMode::Supervised),
            "autonomous" | "auto" => Ok(ApprovalMode::Autonomous),
            _ => bail!(
                "Invalid approval mode '{}'. Valid values: supervised, autonomous",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub mode: PipelineMode,
    #[serde(default)]
    pub approval: ApprovalMode,
    #[serde(default)]
    pub fix_policy: FixPolicy,
    /// Overrides the mode's default assignment cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,
}

/// Shell commands run for each strategy tier. Unset tiers are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contextual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep: Option<String>,
}

impl TierCommands {
    pub fn command_for(&self, tier: StrategyTier) -> Option<&str> {
        let cmd = match tier {
            StrategyTier::Format => &self.format,
            StrategyTier::Imports => &self.imports,
            StrategyTier::Contextual => &self.contextual,
            StrategyTier::Targeted => &self.targeted,
            StrategyTier::Deep => &self.deep,
        };
        cmd.as_deref().filter(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_recurrence_threshold")]
    pub recurrence_threshold: usize,
    #[serde(default = "default_rollback_failures")]
    pub rollback_failures: u32,
    #[serde(default = "default_rollback_window_secs")]
    pub rollback_window_secs: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Fallback verification when the failure carries no command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<String>,
    #[serde(default)]
    pub tiers: TierCommands,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_recurrence_threshold() -> usize {
    3
}

fn default_rollback_failures() -> u32 {
    3
}

fn default_rollback_window_secs() -> u64 {
    900
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            recurrence_threshold: default_recurrence_threshold(),
            rollback_failures: default_rollback_failures(),
            rollback_window_secs: default_rollback_window_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            verify_command: None,
            tiers: TierCommands::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_term_grace_ms")]
    pub term_grace_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_stale_after_secs() -> u64 {
    3600
}

fn default_term_grace_ms() -> u64 {
    2000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            term_grace_ms: default_term_grace_ms(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub memory: MemorySection,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `.conductor/conductor.toml`, or defaults when it is absent.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        crate::util::write_atomic(path, content.as_bytes())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let h = &self.healing;

        if h.max_attempts == 0 {
            warnings.push("healing.max_attempts is 0: every failure is deferred immediately".into());
        }
        if h.max_attempts > 5 {
            warnings.push(format!(
                "healing.max_attempts = {} exceeds the per-signature cap of 5; 5 is used",
                h.max_attempts
            ));
        }
        if h.recurrence_threshold < 2 {
            warnings.push("healing.recurrence_threshold below 2 trips the circuit breaker on the first task".into());
        }
        if h.rollback_failures == 0 {
            warnings.push("healing.rollback_failures is 0: catastrophic rollback is disabled".into());
        }
        if h.attempt_timeout_secs == 0 {
            warnings.push("healing.attempt_timeout_secs is 0: attempts time out immediately".into());
        }
        if StrategyTier::ALL
            .iter()
            .all(|t| h.tiers.command_for(*t).is_none())
        {
            warnings.push("no [healing.tiers] commands configured: only recalled fixes can be tried".into());
        }
        if self.checkpoint.lock_timeout_ms == 0 {
            warnings.push("checkpoint.lock_timeout_ms is 0: a held lock fails without waiting".into());
        }
        if let Some(max) = self.pipeline.max_agents
            && max == 0
        {
            warnings.push("pipeline.max_agents is 0; at least one agent is always assigned".into());
        }

        warnings
    }
}

/// CLI-level overrides, the last configuration layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: bool,
    pub yes: bool,
    pub json: bool,
    pub fix_policy: Option<FixPolicy>,
    pub approval: Option<ApprovalMode>,
    pub dry_run: Option<bool>,
}

/// Resolved configuration used throughout the conductor.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Working directory the pipeline operates on.
    pub root_dir: PathBuf,
    /// `<root>/.conductor`.
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
    pub verbose: bool,
    pub yes: bool,
    pub json: bool,
    fix_policy: FixPolicy,
    approval: ApprovalMode,
    dry_run: bool,
    memory_db: PathBuf,
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl ConductorConfig {
    /// Resolve configuration for `root_dir` from the process environment.
    pub fn load(root_dir: PathBuf, cli: CliOverrides) -> Result<Self> {
        Self::load_with_env(root_dir, cli, |key| std::env::var(key).ok())
    }

    /// Resolve configuration with an explicit environment lookup.
    pub fn load_with_env(
        root_dir: PathBuf,
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let root_dir = root_dir
            .canonicalize()
            .context("Failed to resolve working directory")?;
        let conductor_dir = root_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;

        let mut fix_policy = toml.pipeline.fix_policy;
        if let Some(value) = env(ENV_FIX_POLICY) {
            fix_policy = value
                .parse()
                .with_context(|| format!("{} is invalid", ENV_FIX_POLICY))?;
        }
        if let Some(policy) = cli.fix_policy {
            fix_policy = policy;
        }

        let mut approval = toml.pipeline.approval;
        if let Some(value) = env(ENV_APPROVAL) {
            approval = value
                .parse()
                .with_context(|| format!("{} is invalid", ENV_APPROVAL))?;
        }
        if let Some(mode) = cli.approval {
            approval = mode;
        }

        let mut dry_run = toml.supervisor.dry_run;
        if let Some(value) = env(ENV_DRY_RUN) {
            dry_run = parse_bool(&value);
        }
        if let Some(flag) = cli.dry_run {
            dry_run = flag;
        }

        let memory_db = match env(ENV_MEMORY_DB) {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => match &toml.memory.path {
                Some(path) => path.clone(),
                None => default_memory_db()?,
            },
        };

        Ok(Self {
            root_dir,
            conductor_dir,
            toml,
            verbose: cli.verbose,
            yes: cli.yes,
            json: cli.json,
            fix_policy,
            approval,
            dry_run,
            memory_db,
        })
    }

    pub fn fix_policy(&self) -> FixPolicy {
        self.fix_policy
    }

    /// Approval mode. `--yes` behaves as autonomous.
    pub fn approval(&self) -> ApprovalMode {
        if self.yes {
            ApprovalMode::Autonomous
        } else {
            self.approval
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn memory_db_path(&self) -> &Path {
        &self.memory_db
    }

    /// Effective assignment cap for a pipeline mode.
    pub fn max_agents(&self, mode: PipelineMode) -> usize {
        self.toml
            .pipeline
            .max_agents
            .unwrap_or_else(|| mode.default_max_agents())
            .max(1)
    }

    /// Per-signature attempt cap, never above 5.
    pub fn max_attempts(&self) -> u32 {
        self.toml.healing.max_attempts.min(5)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.healing.attempt_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.toml.checkpoint.lock_timeout_ms)
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.conductor_dir.join("projects")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.conductor_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// `~/.conductor/memory.db`.
pub fn default_memory_db() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(CONDUCTOR_DIR).join("memory.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(root: &Path, content: &str) {
        let dir = root.join(CONDUCTOR_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), content).unwrap();
    }

    // =========================================
    // ApprovalMode tests
    // =========================================

    #[test]
    fn test_approval_mode_from_str() {
        assert_eq!("AUTONOMOUS".parse::<ApprovalMode>().unwrap(), ApprovalMode::Autonomous);
        assert_eq!("supervised".parse::<ApprovalMode>().unwrap(), ApprovalMode::Supervised);
        let err = "sometimes".parse::<ApprovalMode>().unwrap_err();
        assert!(err.to_string().contains("Invalid approval mode"));
    }

    #[test]
    fn test_approval_mode_default() {
        assert_eq!(ApprovalMode::default(), ApprovalMode::Supervised);
    }

    // =========================================
    // ConductorToml tests
    // =========================================

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = ConductorToml::parse("").unwrap();
        assert_eq!(toml.healing.max_attempts, 5);
        assert_eq!(toml.healing.recurrence_threshold, 3);
        assert_eq!(toml.healing.rollback_failures, 3);
        assert_eq!(toml.checkpoint.lock_timeout_ms, 5000);
        assert_eq!(toml.pipeline.fix_policy, FixPolicy::High);
        assert_eq!(toml.pipeline.mode, PipelineMode::Full);
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[project]
name = "shop"

[pipeline]
mode = "lite"
approval = "autonomous"
fix_policy = "all"
max_agents = 4

[healing]
max_attempts = 3
verify_command = "make test"

[healing.tiers]
format = "make fmt"
deep = "  "

[supervisor]
stale_after_secs = 60
"#;
        let toml = ConductorToml::parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("shop"));
        assert_eq!(toml.pipeline.mode, PipelineMode::Lite);
        assert_eq!(toml.pipeline.approval, ApprovalMode::Autonomous);
        assert_eq!(toml.pipeline.max_agents, Some(4));
        assert_eq!(toml.healing.max_attempts, 3);
        assert_eq!(toml.healing.tiers.command_for(StrategyTier::Format), Some("make fmt"));
        assert_eq!(toml.healing.tiers.command_for(StrategyTier::Deep), None);
        assert_eq!(toml.supervisor.stale_after_secs, 60);
        assert_eq!(toml.supervisor.term_grace_ms, 2000);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = ConductorToml::parse("[pipeline]\nfix_policy = \"most\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = ConductorToml::default();
        assert!(toml.validate().iter().any(|w| w.contains("healing.tiers")));

        toml.healing.tiers.format = Some("cargo fmt".into());
        assert!(toml.validate().is_empty());

        toml.healing.max_attempts = 9;
        toml.checkpoint.lock_timeout_ms = 0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = ConductorToml::default();
        toml.healing.verify_command = Some("cargo test".into());
        toml.save(&path).unwrap();
        let loaded = ConductorToml::load(&path).unwrap();
        assert_eq!(loaded.healing.verify_command.as_deref(), Some("cargo test"));
    }

    // =========================================
    // Layering tests
    // =========================================

    #[test]
    fn test_layering_file_then_env_then_cli() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[pipeline]\nfix_policy = \"critical\"\napproval = \"supervised\"\n");

        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            CliOverrides::default(),
            env_from(&[("CONDUCTOR_MEMORY_DB", "/tmp/mem.db")]),
        )
        .unwrap();
        assert_eq!(config.fix_policy(), FixPolicy::Critical);
        assert_eq!(config.memory_db_path(), Path::new("/tmp/mem.db"));

        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            CliOverrides::default(),
            env_from(&[
                ("CONDUCTOR_FIX_POLICY", "all"),
                ("CONDUCTOR_APPROVAL", "autonomous"),
                ("CONDUCTOR_DRY_RUN", "1"),
                ("CONDUCTOR_MEMORY_DB", "/tmp/mem.db"),
            ]),
        )
        .unwrap();
        assert_eq!(config.fix_policy(), FixPolicy::All);
        assert_eq!(config.approval(), ApprovalMode::Autonomous);
        assert!(config.dry_run());

        let cli = CliOverrides {
            fix_policy: Some(FixPolicy::None),
            dry_run: Some(false),
            ..Default::default()
        };
        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            cli,
            env_from(&[("CONDUCTOR_FIX_POLICY", "all"), ("CONDUCTOR_DRY_RUN", "true")]),
        )
        .unwrap();
        assert_eq!(config.fix_policy(), FixPolicy::None);
        assert!(!config.dry_run());
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let dir = tempdir().unwrap();
        let result = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            CliOverrides::default(),
            env_from(&[("CONDUCTOR_APPROVAL", "maybe")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_yes_flag_means_autonomous() {
        let dir = tempdir().unwrap();
        let cli = CliOverrides {
            yes: true,
            ..Default::default()
        };
        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            cli,
            env_from(&[("CONDUCTOR_MEMORY_DB", "/tmp/m.db")]),
        )
        .unwrap();
        assert_eq!(config.approval(), ApprovalMode::Autonomous);
    }

    #[test]
    fn test_max_agents_and_attempt_caps() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[healing]\nmax_attempts = 12\n");
        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            CliOverrides::default(),
            env_from(&[("CONDUCTOR_MEMORY_DB", "/tmp/m.db")]),
        )
        .unwrap();
        assert_eq!(config.max_agents(PipelineMode::Full), 5);
        assert_eq!(config.max_agents(PipelineMode::Lite), 3);
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.lock_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_paths() {
        let dir = tempdir().unwrap();
        let config = ConductorConfig::load_with_env(
            dir.path().to_path_buf(),
            CliOverrides::default(),
            env_from(&[("CONDUCTOR_MEMORY_DB", "/tmp/m.db")]),
        )
        .unwrap();
        assert!(config.project_dir("p1").ends_with(".conductor/projects/p1"));
        assert!(config.config_file().ends_with(".conductor/conductor.toml"));
        assert!(config.log_dir().ends_with(".conductor/logs"));
    }
}
