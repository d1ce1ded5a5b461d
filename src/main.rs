/*!
 * Bulwark CLI - Command Line Interface
 *
 * Version: 0.1.0
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{Context, Result};
use bulwark::{
    config::{LogLevel, OptimizerConfig},
    error::{OptimizerError, EXIT_FAILURE, EXIT_SUCCESS},
    logging,
    workload::{self, WorkloadOptions, WorkloadSummary},
    OptimizationStrategy, Optimizer,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about = "Adaptive circuit breakers, pools, caches and batching for slow downstreams", long_about = None)]
struct Cli {
    /// Path to config file (default: built-in component set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to a TOML file
    Init {
        /// Output path
        #[arg(short, long, default_value = "bulwark.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print a statistics report for the configured instances
    Report,

    /// Drive a synthetic workload through the configured instances
    Simulate {
        /// Strategy to apply before the run (latency or resource)
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Total guarded calls
        #[arg(long, default_value = "200")]
        calls: usize,

        /// Probability (0.0 - 1.0) that a simulated call fails
        #[arg(long, default_value = "0.1")]
        failure_rate: f64,

        /// Concurrent workers
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Distinct cache keys; smaller spaces yield more hits
        #[arg(long, default_value = "50")]
        key_space: usize,

        /// Print the summary and report as a single JSON object
        #[arg(long)]
        json: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum StrategyArg {
    Balanced,
    Latency,
    Resource,
}

impl From<StrategyArg> for OptimizationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Balanced => OptimizationStrategy::Balanced,
            StrategyArg::Latency => OptimizationStrategy::Latency,
            StrategyArg::Resource => OptimizationStrategy::Resource,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<OptimizerError>()
                .map(OptimizerError::exit_code)
                .unwrap_or(EXIT_FAILURE)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output, force } = &cli.command {
        return handle_init(output, *force);
    }

    let mut config = match cli.config {
        Some(ref path) => OptimizerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OptimizerConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    if cli.log.is_some() {
        config.logging.log_file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Init { .. } => Ok(()),
            Commands::Report => handle_report(&config).await,
            Commands::Simulate {
                strategy,
                calls,
                failure_rate,
                concurrency,
                key_space,
                json,
            } => {
                let options = WorkloadOptions {
                    calls,
                    failure_rate,
                    concurrency,
                    key_space,
                    ..Default::default()
                };
                handle_simulate(&config, strategy.map(Into::into), options, json).await
            }
        }
    })
}

fn handle_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(OptimizerError::Config(format!(
            "{} already exists (use --force to overwrite)",
            output.display()
        ))
        .into());
    }
    OptimizerConfig::default().to_file(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

async fn handle_report(config: &OptimizerConfig) -> Result<()> {
    let optimizer = Optimizer::with_config(config).await?;
    let report = optimizer.report().await;
    optimizer.shutdown().await;
    println!("{}", report.to_json()?);
    Ok(())
}

async fn handle_simulate(
    config: &OptimizerConfig,
    strategy: Option<OptimizationStrategy>,
    options: WorkloadOptions,
    json: bool,
) -> Result<()> {
    if !(0.0..=1.0).contains(&options.failure_rate) {
        return Err(OptimizerError::Config(format!(
            "failure rate must be between 0.0 and 1.0, got {}",
            options.failure_rate
        ))
        .into());
    }

    let optimizer = Arc::new(Optimizer::with_config(config).await?);

    // An explicit flag wins over the configured label
    let strategy = strategy.unwrap_or(config.strategy);
    if strategy.is_applicable() {
        optimizer.apply_strategy(strategy).await?;
    }

    let summary = workload::run(optimizer.clone(), options).await?;
    let report = optimizer.report().await;
    optimizer.shutdown().await;

    if json {
        let combined = serde_json::json!({ "summary": summary, "report": report });
        println!("{}", serde_json::to_string_pretty(&combined)?);
    } else {
        print_summary(&summary);
        println!("{}", report.to_json()?);
    }
    Ok(())
}

fn print_summary(summary: &WorkloadSummary) {
    println!();
    println!("Workload summary");
    println!("  Calls:               {}", summary.calls);
    println!("  Succeeded:           {}", summary.succeeded);
    println!("  Downstream failures: {}", summary.downstream_failures);
    println!("  Rejected (open):     {}", summary.rejected_by_breaker);
    println!("  Pool exhausted:      {}", summary.pool_exhausted);
    println!("  Batched writes:      {}", summary.batched_writes);
    if summary.batch_failures > 0 {
        println!("  Batch failures:      {}", summary.batch_failures);
    }
    println!();
}
