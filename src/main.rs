use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use conductor::conductor_config::{CONDUCTOR_DIR, CliOverrides, ConductorConfig};
use conductor::errors::ConductorError;
use conductor::memory::MemoryCategory;
use conductor::orchestrator::Conductor;
use conductor::phase::PhaseId;
use conductor::project::FixPolicy;
use conductor::supervisor::ProcessKind;

mod cmd;

/// Tracing filter for stderr output.
const ENV_LOG: &str = "CONDUCTOR_LOG";

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Drive multi-worker pipelines through gated, checkpointed phases")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve phase transitions without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a project for a request and make it current
    Init {
        request: String,
        /// Use the lite pipeline (fewer worker roles)
        #[arg(long)]
        lite: bool,
        /// Severities remediated automatically: all, high, critical, none
        #[arg(long)]
        fix_policy: Option<FixPolicy>,
    },
    /// Write the discovery artifact and leave discover
    Discover,
    /// Rank worker roles, write assignments and leave plan
    SelectAgents {
        /// Maximum number of roles to assign
        #[arg(long)]
        max: Option<usize>,
    },
    /// Check worker reports and raise remediation tasks
    Synthesize,
    /// Start the next open remediation task
    Remediate,
    /// Close a remediation task
    RemediateDone {
        #[arg(long)]
        task: String,
        /// Defer the task instead of fixing it
        #[arg(long)]
        defer: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Check every task is fixed or deferred and leave execute
    RemediateVerify,
    /// Scaffold or validate a task's root-cause analysis
    CoeAnalyze {
        #[arg(long)]
        task: String,
        /// Record the result on the task
        #[arg(long)]
        validate: bool,
    },
    /// Search the working tree for other sites of a task's pattern
    PatternSweep {
        #[arg(long)]
        task: String,
    },
    /// Evaluate a phase-exit gate, optionally overriding named rules
    PeGate {
        #[arg(long)]
        from: PhaseId,
        #[arg(long)]
        to: PhaseId,
        #[arg(long)]
        force: bool,
        /// Rule to downgrade to a warning (repeatable)
        #[arg(long = "override")]
        overrides: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Check validation and complete the project
    Finalize,
    /// Reload the last valid checkpoint and sweep stale processes
    Resume,
    /// Show the current project
    Status,
    /// Abandon the current project
    Abort {
        #[arg(long)]
        reason: String,
    },
    /// Record an accepted decision
    Decide { text: String },
    /// Hand a failure to the self-healing engine
    Heal {
        #[arg(long)]
        error: String,
        #[arg(long)]
        location: Option<String>,
        /// Command that produced the failure; re-run to verify fixes
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        step: Option<String>,
    },
    /// Query or append to pattern memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// Track and sweep worker processes
    Proc {
        #[command(subcommand)]
        command: ProcCommands,
    },
    /// Inspect or restore checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum MemoryCommands {
    /// Append a record
    Store {
        description: String,
        #[arg(long, default_value = "note")]
        category: MemoryCategory,
        #[arg(long, default_value = "general")]
        domain: String,
        #[arg(long)]
        signature: Option<String>,
        #[arg(long)]
        fix: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Id of the record this one corrects
        #[arg(long)]
        supersedes: Option<i64>,
    },
    /// Full-text search
    Query {
        text: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Has this been seen before?
    Check { text: String },
}

#[derive(Subcommand, Clone)]
pub enum ProcCommands {
    /// Register a running process
    Register {
        #[arg(long)]
        pid: u32,
        #[arg(long, default_value = "worker")]
        kind: ProcessKind,
        #[arg(long)]
        purpose: String,
        /// Owning process (defaults to the caller's parent)
        #[arg(long)]
        owner: Option<u32>,
    },
    /// Refresh a registered process's heartbeat
    Heartbeat {
        #[arg(long)]
        pid: u32,
    },
    /// Remove a process from the registry
    Deregister {
        #[arg(long)]
        pid: u32,
    },
    /// Drop dead records and terminate orphans
    Sweep {
        /// Report without signalling
        #[arg(long)]
        dry_run: bool,
        /// Terminate every registered live process
        #[arg(long)]
        force: bool,
        /// Pid to check (repeatable); unregistered pids are never signalled
        #[arg(long = "pid")]
        pids: Vec<u32>,
    },
    /// List registered processes
    Status,
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// List checkpoints with their validity
    List,
    /// Validate every checkpoint
    Verify,
    /// Restore a checkpoint as the newest one
    Restore {
        seq: u64,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

/// Stderr logging filtered by `CONDUCTOR_LOG`, plus an info-level file log
/// once `.conductor/` exists.
fn init_tracing(verbose: bool, root: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let conductor_dir = root.join(CONDUCTOR_DIR);
    let (file, guard) = if conductor_dir.is_dir() {
        let appender = tracing_appender::rolling::daily(conductor_dir.join("logs"), "conductor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(LevelFilter::INFO);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

async fn run(cli: &Cli, root: PathBuf) -> Result<(), ConductorError> {
    let overrides = CliOverrides {
        verbose: cli.verbose,
        yes: cli.yes,
        json: cli.json,
        ..Default::default()
    };
    // Config commands must work even when conductor.toml does not parse.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&root, overrides, command.clone()).map_err(Into::into);
    }

    let config = ConductorConfig::load(root, overrides)?;
    for warning in config.validate() {
        tracing::debug!("config: {}", warning);
    }
    let conductor = Conductor::new(config);

    match &cli.command {
        Commands::Heal {
            error,
            location,
            command,
            task,
            step,
        } => {
            cmd::cmd_heal(
                &conductor,
                error,
                location.clone(),
                command.clone(),
                task.clone(),
                step.clone(),
            )
            .await
        }
        Commands::Memory { command } => cmd::cmd_memory(&conductor.config, command.clone()),
        Commands::Proc { command } => cmd::cmd_proc(&conductor, command.clone()),
        Commands::Checkpoint { command } => cmd::cmd_checkpoint(&conductor, command.clone()),
        other => cmd::cmd_pipeline(&conductor, other).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let root = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("error: Failed to get current directory: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    // A missing .env is fine.
    let _ = dotenvy::from_path(root.join(".env"));
    let _guard = init_tracing(cli.verbose, &root);

    match run(&cli, root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(kind = err.kind(), "Command failed: {:#}", err);
            cmd::report_error(&err, cli.json);
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
