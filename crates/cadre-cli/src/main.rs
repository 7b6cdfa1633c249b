//! Cadre CLI - dependency-graph scheduling for agent fleets
//!
//! Usage:
//!   cadre init                  Write a default .cadre/config.toml
//!   cadre plan [--changed f]    Show the execution plan for a change set
//!   cadre run [--changed f]     Execute the plan (exit 0 only on success)
//!   cadre history               Show the persisted test run history
//!   cadre checkpoints           List checkpoint records, optionally pruning

mod agents;

use anyhow::{Context, Result};
use cadre_bus::EventBus;
use cadre_core::{AgentRunStatus, CadreConfig, CadreError, RunHistory};
use cadre_orchestrator::{Orchestrator, OrchestratorConfig};
use cadre_pool::{AgentPool, AgentPoolConfig, SystemClock};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::agents::command_agent_loader;

#[derive(Parser)]
#[command(name = "cadre")]
#[command(author, version, about = "Dependency-graph scheduling for agent fleets")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root (defaults to current directory)
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration to .cadre/config.toml
    Init,

    /// Show the execution plan without running anything
    Plan {
        /// Changed files restricting the plan; none means "all agents"
        #[arg(long = "changed", value_name = "FILE")]
        changed: Vec<String>,
    },

    /// Build and execute the plan
    Run {
        /// Changed files restricting the run; none means "all agents"
        #[arg(long = "changed", value_name = "FILE")]
        changed: Vec<String>,

        /// Override the configured concurrency bound
        #[arg(long)]
        concurrency: Option<usize>,

        /// Keep the checkpoint untouched even when the run fails
        #[arg(long)]
        no_rollback: bool,
    },

    /// Show the persisted test run history
    History {
        /// History file (defaults to .cadre/test-history.json)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List checkpoint records
    Checkpoints {
        /// Prune terminal records older than this many days
        #[arg(long, value_name = "DAYS")]
        prune: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let repo_root = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository root {:?} not found", cli.repo))?;

    match cli.command {
        Commands::Init => {
            CadreConfig::write_default(&repo_root)?;
            println!("Wrote {}", repo_root.join(".cadre/config.toml").display());
            Ok(())
        }
        Commands::Plan { changed } => {
            let orchestrator = build_orchestrator(&repo_root, None, false)?;
            let plan = orchestrator.build_execution_plan(&changed)?;

            if plan.is_empty() {
                println!("No agents affected");
                return Ok(());
            }
            for (level, group) in plan.groups.iter().enumerate() {
                println!("level {}: {}", level, group.join(", "));
            }
            println!("{} agents total", plan.total_agents);
            Ok(())
        }
        Commands::Run {
            changed,
            concurrency,
            no_rollback,
        } => run(&repo_root, changed, concurrency, no_rollback).await,
        Commands::History { file } => {
            let path = file.unwrap_or_else(|| repo_root.join(".cadre/test-history.json"));
            let history = RunHistory::load(path).await?;

            if history.records().is_empty() {
                println!("No run history recorded");
                return Ok(());
            }
            for (name, record) in history.records() {
                println!(
                    "{}: {} runs, {} failures ({:.0}% failure rate), {} consecutive",
                    name,
                    record.total_runs,
                    record.failures,
                    record.failure_rate() * 100.0,
                    record.consecutive_failures
                );
            }
            Ok(())
        }
        Commands::Checkpoints { prune } => {
            let orchestrator = build_orchestrator(&repo_root, None, false)?;

            if let Some(days) = prune {
                let removed = orchestrator
                    .checkpoints()
                    .prune_older_than(chrono::Duration::days(days))
                    .await?;
                println!("Pruned {} checkpoint record(s)", removed);
            }

            let checkpoints = orchestrator.checkpoints().load_all().await?;
            if checkpoints.is_empty() {
                println!("No checkpoint records");
                return Ok(());
            }
            for checkpoint in checkpoints {
                println!(
                    "{} {:?} {} ({} @ {})",
                    checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.status,
                    checkpoint.id,
                    checkpoint.captured.branch,
                    &checkpoint.captured.commit[..checkpoint.captured.commit.len().min(12)],
                );
            }
            Ok(())
        }
    }
}

/// Construct the component graph explicitly and wire it by reference
fn build_orchestrator(
    repo_root: &std::path::Path,
    concurrency: Option<usize>,
    no_rollback: bool,
) -> Result<Orchestrator<cadre_orchestrator::GitCommand>> {
    let config = CadreConfig::load_or_default(repo_root)?;

    let bus = EventBus::new();
    let pool = Arc::new(AgentPool::new(bus.clone(), Arc::new(SystemClock)));

    let orch_config = OrchestratorConfig::new(repo_root)
        .with_max_concurrency(concurrency.unwrap_or(config.orchestrator.max_concurrency))
        .with_rollback(config.orchestrator.rollback_enabled && !no_rollback)
        .with_checkpoint_dir(repo_root.join(&config.orchestrator.checkpoint_dir));

    let mut orchestrator = Orchestrator::new(orch_config, bus, Arc::clone(&pool));

    for entry in &config.agents {
        let dependencies: Vec<&str> = entry.dependencies.iter().map(String::as_str).collect();
        let patterns: Vec<&str> = entry.file_patterns.iter().map(String::as_str).collect();
        orchestrator.register_agent(
            &entry.name,
            &dependencies,
            &patterns,
            command_agent_loader(entry),
            AgentPoolConfig::from_defaults(&config.pool),
        )?;
    }

    if config.agents.is_empty() {
        info!("No agents declared in .cadre/config.toml");
    }

    Ok(orchestrator)
}

async fn run(
    repo_root: &std::path::Path,
    changed: Vec<String>,
    concurrency: Option<usize>,
    no_rollback: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(repo_root, concurrency, no_rollback)?;
    let plan = orchestrator.build_execution_plan(&changed)?;

    if plan.is_empty() {
        println!("No agents affected; nothing to run");
        return Ok(());
    }

    info!(
        "Running {} agents in {} levels",
        plan.total_agents,
        plan.groups.len()
    );

    match orchestrator.execute(&plan).await {
        Ok(outcomes) => {
            for outcome in outcomes.values() {
                println!(
                    "{} {} ({}ms)",
                    outcome.agent,
                    outcome.status,
                    outcome.duration_ms.unwrap_or(0)
                );
            }
            println!("Run committed");
            Ok(())
        }
        Err(CadreError::OrchestrationFailed { outcomes }) => {
            for outcome in outcomes.values() {
                match outcome.status {
                    AgentRunStatus::Failed => println!(
                        "{} failed: {}",
                        outcome.agent,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                    status => println!("{} {}", outcome.agent, status),
                }
            }
            eprintln!("Run failed and was rolled back");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
