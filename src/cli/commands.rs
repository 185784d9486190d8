//! CLI command definitions for condforge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing::warn;

use crate::agent::{AgentPort, CommandAgentAdapter, MockAgentAdapter};
use crate::executor::{BatchExecutor, ExecutorConfig};
use crate::grader::{Grader, MockGrader, RepoGrader};
use crate::model::BatchResults;
use crate::stats::{PerConditionStatistics, TaskStatistics};
use crate::storage::{Storage, StreamingFileAdapter};
use crate::trace::LogTracer;

/// Prompting-condition experiment runner for coding agents.
#[derive(Parser)]
#[command(name = "condforge")]
#[command(about = "Execute, grade and aggregate prompting-condition experiments")]
#[command(version)]
#[command(
    long_about = "condforge runs a batch of (task x condition x attempt) experiments against a \
coding agent, grades every attempt, and aggregates outcomes.\n\nResults stream to \
results/<batch>/results.jsonl as they complete; a crashed batch resumes with --resume.\n\n\
Example usage:\n  condforge run experiments/rep-002/scenarios/pilot.yaml --resume"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute an experiment batch.
    Run(RunArgs),

    /// Show what a batch would execute, without running anything.
    #[command(alias = "dry-run")]
    Plan(PlanArgs),

    /// Rebuild and print the summary for a batch from persisted results.
    Report(ReportArgs),
}

/// Arguments for `condforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the batch configuration YAML.
    pub batch: PathBuf,

    /// Skip runs whose results are already persisted.
    #[arg(long)]
    pub resume: bool,

    /// Directory for results files.
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Use a mock agent and grader (no external calls).
    #[arg(long)]
    pub mock: bool,

    /// Command for the external agent.
    #[arg(long, default_value = "claude", env = "CONDFORGE_AGENT_CMD")]
    pub agent_cmd: String,

    /// Directory for grader checkouts; a temp directory by default.
    #[arg(long)]
    pub workspace_dir: Option<PathBuf>,

    /// Keep grader workspaces after each run (debugging).
    #[arg(long)]
    pub keep_workspace: bool,

    /// Timeout per agent generation, in seconds.
    #[arg(long, default_value_t = 600)]
    pub agent_timeout_secs: u64,

    /// Timeout per test subprocess, in seconds.
    #[arg(long, default_value_t = 300)]
    pub test_timeout_secs: u64,
}

/// Arguments for `condforge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Path to the batch configuration YAML.
    pub batch: PathBuf,

    /// Directory for results files (used to compute remaining runs).
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,
}

/// Arguments for `condforge report`.
#[derive(Parser, Debug)]
pub struct ReportArgs {
    /// Batch name (the directory under the results dir).
    pub batch_name: String,

    /// Directory for results files.
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Plan(args) => cmd_plan(args).await,
        Commands::Report(args) => cmd_report(args).await,
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let storage = Arc::new(StreamingFileAdapter::new(&args.results_dir));

    // Configuration errors are fatal: no partial batch is started.
    let batch = storage
        .load_batch(&args.batch)
        .with_context(|| format!("Failed to load batch {}", args.batch.display()))?;
    let total = batch.total_runs();

    // Keep a temp workspace alive for the whole batch when none is given.
    let mut workspace_guard = None;
    let (agent, grader): (Arc<dyn AgentPort>, Arc<dyn Grader>) = if args.mock {
        (
            Arc::new(MockAgentAdapter::always("mock solution")) as Arc<dyn AgentPort>,
            Arc::new(MockGrader::random(0.5)) as Arc<dyn Grader>,
        )
    } else {
        let workspace_dir = match args.workspace_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let temp = tempfile::tempdir().context("Failed to create workspace dir")?;
                let path = temp.path().to_path_buf();
                workspace_guard = Some(temp);
                path
            }
        };
        (
            Arc::new(CommandAgentAdapter::new(&args.agent_cmd)) as Arc<dyn AgentPort>,
            Arc::new(
                RepoGrader::new(workspace_dir)
                    .with_test_timeout(Duration::from_secs(args.test_timeout_secs))
                    .with_keep_workspace(args.keep_workspace),
            ) as Arc<dyn Grader>,
        )
    };

    let executor = BatchExecutor::new(agent, grader, storage.clone())
        .with_tracer(Arc::new(LogTracer))
        .with_config(ExecutorConfig {
            agent_timeout: Duration::from_secs(args.agent_timeout_secs),
        });

    // Operator interrupt: stop before the next run, keep results intact.
    let cancel = executor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current run");
            cancel.cancel();
        }
    });

    println!(
        "Batch '{}': {} tasks x {} conditions x {} attempts = {} runs",
        batch.name,
        batch.tasks.len(),
        batch.conditions.len(),
        batch.runs_per_condition,
        total
    );

    let batch_name = batch.name.clone();
    let mut stats = PerConditionStatistics::new();
    let mut done = 0u64;
    {
        let stream = executor.execute(batch, args.resume);
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let result = item.context("Batch aborted: storage failure")?;
            done += 1;
            stats.update(&result);

            let status = if result.passed { "PASS" } else { "FAIL" };
            let note = result
                .error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default();
            println!("[{}/{}] {}  {}{}", done, total, result.identity(), status, note);
        }
    }

    println!();
    print_condition_table(&stats);
    println!(
        "\nSummary written to {}",
        storage.summary_path(&batch_name).display()
    );

    drop(workspace_guard);
    Ok(())
}

async fn cmd_plan(args: PlanArgs) -> anyhow::Result<()> {
    let storage = StreamingFileAdapter::new(&args.results_dir);
    let batch = storage
        .load_batch(&args.batch)
        .with_context(|| format!("Failed to load batch {}", args.batch.display()))?;

    println!("Batch:              {}", batch.name);
    println!("Model:              {}", batch.model);
    println!(
        "Iteration:          {:?} (max {})",
        batch.iteration.strategy, batch.iteration.max_iterations
    );
    println!("Tasks:              {}", batch.tasks.len());
    for task in &batch.tasks {
        println!("  - {} ({})", task.id, task.difficulty);
    }
    println!("Conditions:         {}", batch.conditions.len());
    for condition in &batch.conditions {
        println!("  - {} ({})", condition.name, condition.condition_type);
    }
    println!("Runs per condition: {}", batch.runs_per_condition);
    println!("Total runs:         {}", batch.total_runs());

    if storage.batch_exists(&batch.name) {
        let completed = storage.get_completed_runs(&batch.name).await?;
        println!("Already completed:  {}", completed.len());
        println!(
            "Remaining:          {}",
            batch.total_runs().saturating_sub(completed.len() as u64)
        );
    }

    Ok(())
}

async fn cmd_report(args: ReportArgs) -> anyhow::Result<()> {
    let storage = StreamingFileAdapter::new(&args.results_dir);
    if !storage.batch_exists(&args.batch_name) {
        anyhow::bail!(
            "No results found for batch '{}' in {}",
            args.batch_name,
            args.results_dir.display()
        );
    }

    let mut summary = BatchResults::new(&args.batch_name);
    let mut stats = PerConditionStatistics::new();
    let mut task_stats = TaskStatistics::new();
    {
        let mut stream = storage.stream_results(&args.batch_name);
        while let Some(result) = stream.next().await {
            let result = result.context("Corrupt results stream")?;
            summary.add_result(&result);
            stats.update(&result);
            task_stats.update(&result);
        }
    }

    println!("Batch:     {}", summary.batch_name);
    println!("Completed: {}", summary.completed_runs);
    println!(
        "Passed:    {} ({:.1}%)",
        summary.passed_runs,
        summary.pass_rate() * 100.0
    );
    println!();
    print_condition_table(&stats);

    let hardest = task_stats.hardest_tasks(5);
    if !hardest.is_empty() {
        println!("\nHardest tasks:");
        for (task_id, pass_rate) in hardest {
            println!("  {:<40} {:>6.1}%", task_id, pass_rate * 100.0);
        }
    }

    Ok(())
}

fn print_condition_table(stats: &PerConditionStatistics) {
    println!(
        "{:<24} {:>6} {:>8} {:>12} {:>12} {:>10}",
        "condition", "runs", "pass%", "avg tokens", "sd tokens", "avg iters"
    );
    let mut names: Vec<&String> = stats.by_condition.keys().collect();
    names.sort();
    for name in names {
        let s = &stats.by_condition[name];
        println!(
            "{:<24} {:>6} {:>7.1}% {:>12.0} {:>12.0} {:>10.2}",
            name,
            s.n,
            s.pass_rate() * 100.0,
            s.avg_tokens(),
            s.std_tokens(),
            s.avg_iterations()
        );
    }
    println!(
        "{:<24} {:>6} {:>7.1}% {:>12.0} {:>12.0} {:>10.2}",
        "overall",
        stats.overall.n,
        stats.overall.pass_rate() * 100.0,
        stats.overall.avg_tokens(),
        stats.overall.std_tokens(),
        stats.overall.avg_iterations()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::parse_from(["condforge", "run", "batch.yaml"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.batch, PathBuf::from("batch.yaml"));
                assert!(!args.resume);
                assert!(!args.mock);
                assert_eq!(args.results_dir, PathBuf::from("results"));
                assert_eq!(args.agent_timeout_secs, 600);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_plan_alias() {
        let cli = Cli::parse_from(["condforge", "dry-run", "batch.yaml"]);
        assert!(matches!(cli.command, Commands::Plan(_)));
    }
}
