use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use weave::agent::CommandAgent;
use weave::collab::GitWorkspace;
use weave::config::Config;
use weave::core::TaskGraph;
use weave::execution::{ExecutionLoop, Plan, StaticPlanner};
use weave::sandbox::{SandboxTaskExecutor, SubmitOptions};
use weave::Result;

/// Weave - dependency-ordered multi-agent task execution
#[derive(Parser, Debug)]
#[command(name = "weave")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEAVE_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.weave/weave.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.weave/weave.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan and print the execution report as JSON
    Run {
        /// Plan file (.toml or .json)
        plan: PathBuf,

        /// Repository the agents work on
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Override the configured number of rounds
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Override the plan's goal
        #[arg(long)]
        goal: Option<String>,
    },

    /// Validate a plan and print its topological order
    Check {
        /// Plan file (.toml or .json)
        plan: PathBuf,
    },

    /// Run one command through the sandbox executor
    Exec {
        /// Shell command
        command: String,

        /// Timeout in seconds (defaults to the configured timeout)
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Remove weave worktrees, agent branches and base refs
    Cleanup {
        /// Repository to clean
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    weave::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            plan,
            repo,
            max_rounds,
            goal,
        } => run_plan(&config, &plan, &repo, max_rounds, goal),
        Command::Check { plan } => run_check(&plan),
        Command::Exec {
            command,
            timeout,
            cwd,
        } => run_exec(&config, &command, timeout, cwd),
        Command::Cleanup { repo } => run_cleanup(&config, &repo),
    }
}

fn run_plan(
    config: &Config,
    plan: &Path,
    repo: &Path,
    max_rounds: Option<u32>,
    goal: Option<String>,
) -> Result<()> {
    let planner = Arc::new(StaticPlanner::load(plan)?);
    let repo = repo.canonicalize()?;
    info!(plan = %plan.display(), repo = %repo.display(), "weave run");

    let agent = CommandAgent::from_config(&config.agent);
    if !agent.is_available() {
        warn!(binary = agent.binary(), "Agent command not found on PATH");
        eprintln!("warning: agent command `{}` not found on PATH", agent.binary());
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let mut engine = ExecutionLoop::from_config(&repo, planner, config)?;
        if let Some(max_rounds) = max_rounds {
            engine = engine.with_max_rounds(max_rounds);
        }
        let report = engine.run(goal.as_deref().unwrap_or_default()).await;
        engine.sandbox().shutdown().await;
        report
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.accepted {
        if let Some(path) = weave::log::log_path() {
            eprintln!("Plan not accepted, details in {}", path.display());
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_check(plan: &Path) -> Result<()> {
    let plan = Plan::load(plan)?;
    let graph = TaskGraph::from_plan(&plan)?;
    println!("Plan OK: {} nodes, {} dependencies", graph.len(), graph.dependency_count());
    for (i, id) in graph.topological_order()?.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, id);
    }
    Ok(())
}

fn run_exec(config: &Config, command: &str, timeout: Option<u64>, cwd: Option<PathBuf>) -> Result<()> {
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.sandbox.default_timeout());

    let rt = tokio::runtime::Runtime::new()?;
    let task = rt.block_on(async {
        let executor = SandboxTaskExecutor::local(&config.sandbox)?;
        let mut options = SubmitOptions::new().timeout(timeout);
        if let Some(cwd) = cwd {
            options = options.working_dir(cwd);
        }
        let id = executor.submit(command, options).await?;
        let task = executor.wait(id, timeout + Duration::from_secs(5)).await;
        executor.shutdown().await;
        task
    })?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    if !task.is_success() {
        std::process::exit(task.exit_code.filter(|&c| c != 0).unwrap_or(1));
    }
    Ok(())
}

fn run_cleanup(config: &Config, repo: &Path) -> Result<()> {
    let repo = repo.canonicalize()?;
    let workspace = GitWorkspace::from_config(&repo, config)?;
    let removed = workspace.cleanup()?;
    println!("Removed {} worktree(s)", removed);
    Ok(())
}
