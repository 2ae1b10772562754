// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::session::stage::RunStage;
use crate::types::ExecutorKind;

/// Command-line arguments for `mcuflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mcuflow",
    version,
    about = "Install toolchains and run ML models through MCU build pipelines.",
    long_about = None
)]
pub struct CliArgs {
    /// Environment directory (the one holding `environment.toml`).
    ///
    /// If omitted, `MCUFLOW_HOME` or the current directory is used.
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MCUFLOW_LOG` or the environment default will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Install the dependencies declared in the environment.
    Setup(SetupArgs),
    /// Run models through the pipeline.
    Flow(FlowArgs),
    /// Process-pool child: reads run initializers as JSON on stdin.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// List or clean up session workspaces.
    Sessions(SessionsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SetupArgs {
    /// Only invoke this task (its dependencies must already be installed).
    #[arg(long, value_name = "NAME")]
    pub task: Option<String>,

    /// Force every task to rebuild.
    #[arg(long)]
    pub rebuild: bool,

    /// Show a progress bar.
    #[arg(long)]
    pub progress: bool,

    /// Continue with the remaining tasks when a task body fails.
    #[arg(long)]
    pub keep_going: bool,

    /// Print the installation order without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the task graph in Graphviz format to this path.
    #[arg(long, value_name = "PATH")]
    pub dot: Option<PathBuf>,

    /// Let task commands print their output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Threads handed to each task body.
    #[arg(long, default_value_t = 4)]
    pub threads: usize,
}

#[derive(Debug, Clone, Args)]
pub struct FlowArgs {
    /// Model name or path (repeatable).
    #[arg(long = "model", required = true)]
    pub models: Vec<String>,

    #[arg(long)]
    pub frontend: Option<String>,

    /// Backend name (repeatable, fans out runs).
    #[arg(long = "backend")]
    pub backends: Vec<String>,

    #[arg(long)]
    pub platform: Option<String>,

    /// Target name (repeatable, fans out runs).
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Feature name (repeatable, applied in the given order).
    #[arg(short = 'f', long = "feature")]
    pub features: Vec<String>,

    /// Config override as KEY=VALUE (repeatable).
    #[arg(short = 'c', long = "config", value_parser = parse_key_value)]
    pub config: Vec<(String, String)>,

    /// Postprocess name (repeatable). Run-level ones become the POSTPROCESS
    /// stage, session-level ones are applied to the session report.
    #[arg(short = 'p', long = "postprocess")]
    pub postprocesses: Vec<String>,

    /// Last stage to process.
    #[arg(long, default_value = "done")]
    pub until: RunStage,

    /// Complete each stage for all runs before starting the next one.
    #[arg(long)]
    pub per_stage: bool,

    /// Number of workers (overrides `[session].num_workers`).
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    #[arg(long)]
    pub executor: Option<ExecutorKind>,

    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub shuffle: bool,

    #[arg(long)]
    pub progress: bool,

    /// Session label.
    #[arg(long, default_value = "")]
    pub label: String,

    /// Comment attached to every run.
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Session directory the runs live in.
    #[arg(long, value_name = "DIR")]
    pub session_dir: PathBuf,

    #[arg(long)]
    pub until: RunStage,
}

#[derive(Debug, Clone, Args)]
pub struct SessionsArgs {
    /// Delete old sessions, keeping the newest N.
    #[arg(long, value_name = "KEEP")]
    pub cleanup: Option<usize>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
