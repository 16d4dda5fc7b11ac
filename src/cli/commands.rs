//! CLI command definitions for mlops-forge.
//!
//! Without a subcommand the coordinator runs continuously, or for exactly
//! one cycle with `--single`. `plan` and `history` are read-only views.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::ForgeConfig;
use crate::coordinator::{CycleError, CycleReport, Plan, RunCoordinator};
use crate::history::HistoryStore;
use crate::metrics::init_metrics;
use crate::scheduler::{install_signal_handlers, CancelSignal};

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

/// Incremental scheduler for multi-stage ML pipelines.
#[derive(Parser, Debug)]
#[command(name = "mlops-forge")]
#[command(about = "Retrain and re-evaluate ML pipeline components only when their code changes")]
#[command(version)]
#[command(
    long_about = "mlops-forge discovers pipelines from a source list, fingerprints every model and ensemble, and runs only the train/test stages whose fingerprints changed since their last success.\n\nExample usage:\n  mlops-forge --single --workers 4\n  mlops-forge plan --json"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run exactly one cycle and exit.
    #[arg(long)]
    pub single: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true, env = "MLOPS_LOG_LEVEL")]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "MLOPS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker pool size.
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Pipeline source list.
    #[arg(long, global = true)]
    pub sources: Option<PathBuf>,

    /// Dataset root directory.
    #[arg(long, global = true)]
    pub datasets_dir: Option<PathBuf>,

    /// Artifact root directory.
    #[arg(long, global = true)]
    pub artifacts_dir: Option<PathBuf>,

    /// SQLite history file.
    #[arg(long, global = true)]
    pub history: Option<PathBuf>,

    /// Per-task timeout in seconds.
    #[arg(long, global = true)]
    pub task_timeout: Option<u64>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the stale tasks the next cycle would execute.
    Plan(OutputArgs),

    /// List recorded fingerprints.
    History(OutputArgs),
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl Cli {
    /// Resolves configuration: file and environment first, then flags.
    pub fn forge_config(&self) -> anyhow::Result<ForgeConfig> {
        let mut config = ForgeConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(path) = &self.sources {
            config = config.with_sources_file(path);
        }
        if let Some(path) = &self.datasets_dir {
            config = config.with_datasets_dir(path);
        }
        if let Some(path) = &self.artifacts_dir {
            config = config.with_artifacts_dir(path);
        }
        if let Some(path) = &self.history {
            config = config.with_history_path(path);
        }
        if let Some(secs) = self.task_timeout {
            config = config.with_task_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns exit code 130 when the run was interrupted by the operator.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.forge_config()?;

    match &cli.command {
        Some(Commands::History(args)) => run_history_command(&config, args).await,
        Some(Commands::Plan(args)) => run_plan_command(&config, args).await,
        None => run_coordinator(&config, cli.single).await,
    }
}

async fn run_coordinator(config: &ForgeConfig, single: bool) -> anyhow::Result<ExitCode> {
    init_metrics().context("Failed to initialize metrics")?;

    let cancel = CancelSignal::new();
    install_signal_handlers(cancel.clone()).context("Failed to install signal handlers")?;

    let coordinator = RunCoordinator::from_config(config, cancel).await?;
    info!(
        workers = config.workers,
        sources = %config.sources_file.display(),
        single = single,
        "Coordinator started"
    );

    let result = if single {
        coordinator.run_once().await.map(|report| print_report(&report))
    } else {
        coordinator
            .run_forever(config.idle_interval, config.error_backoff)
            .await
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(CycleError::Cancelled) => {
            info!("Interrupted, shutting down");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_plan_command(config: &ForgeConfig, args: &OutputArgs) -> anyhow::Result<ExitCode> {
    let coordinator = RunCoordinator::from_config(config, CancelSignal::new()).await?;
    let plan = coordinator.plan().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_history_command(config: &ForgeConfig, args: &OutputArgs) -> anyhow::Result<ExitCode> {
    let store = HistoryStore::open(&config.history_path, config.history_scope.clone())
        .await
        .with_context(|| format!("Failed to open history at {}", config.history_path.display()))?;
    let records = store.records().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No history recorded in scope '{}'", store.scope());
    } else {
        for record in &records {
            println!(
                "{:<60} {:<9} {} ({})",
                record.task_key,
                record.axis,
                record.fingerprint,
                record.updated_at.to_rfc3339()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_plan(plan: &Plan) {
    println!(
        "{} stale of {} tasks considered",
        plan.tasks.len(),
        plan.considered
    );
    for task in &plan.tasks {
        let mut reasons: Vec<&str> = task.stale_axes.iter().map(|a| a.as_str()).collect();
        if task.outputs_missing {
            reasons.push("outputs");
        }
        println!("  {:<60} {:<9} stale: {}", task.key, task.kind, reasons.join(","));
    }
    for skipped in &plan.skipped {
        println!(
            "  skipped {}/{} {}: {}",
            skipped.pipeline, skipped.kind, skipped.component, skipped.reason
        );
    }
    for excluded in &plan.excluded {
        println!("  excluded {}: {}", excluded.locator, excluded.reason);
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "Cycle {}: {} executed ({} succeeded, {} failed), {} deferred, {} skipped, {} pipelines excluded",
        report.cycle_id,
        report.executed,
        report.succeeded,
        report.failed,
        report.deferred,
        report.skipped.len(),
        report.excluded.len()
    );
    println!(
        "  since start: {} succeeded, {} failed ({:.1}% success), {:?} average task time",
        report.pool.tasks_succeeded,
        report.pool.tasks_failed,
        report.pool.success_rate(),
        report.pool.average_task_duration
    );
    for result in report.results.iter().filter(|r| r.error_detail.is_some()) {
        println!(
            "  {} {}: see {}",
            result.key,
            result.outcome,
            result.artifact_dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_is_continuous_run() {
        let cli = Cli::try_parse_from(["mlops-forge"]).expect("should parse");
        assert!(cli.command.is_none());
        assert!(!cli.single);
        assert!(cli.workers.is_none());
    }

    #[test]
    fn test_single_with_overrides() {
        let cli = Cli::try_parse_from([
            "mlops-forge",
            "--single",
            "--workers",
            "4",
            "--artifacts-dir",
            "/srv/artifacts",
            "--task-timeout",
            "120",
        ])
        .expect("should parse");

        assert!(cli.single);
        let config = cli.forge_config().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.artifacts_dir, PathBuf::from("/srv/artifacts"));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_plan_json_subcommand() {
        let cli = Cli::try_parse_from(["mlops-forge", "plan", "--json", "-w", "2"])
            .expect("should parse");
        match cli.command {
            Some(Commands::Plan(args)) => assert!(args.json),
            other => panic!("Expected Plan command, got {:?}", other),
        }
        assert_eq!(cli.workers, Some(2));
    }

    #[test]
    fn test_history_subcommand() {
        let cli = Cli::try_parse_from(["mlops-forge", "history"]).expect("should parse");
        assert!(matches!(cli.command, Some(Commands::History(ref a)) if !a.json));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = Cli::try_parse_from(["mlops-forge", "--workers", "0"]).expect("should parse");
        assert!(cli.forge_config().is_err());
    }
}
