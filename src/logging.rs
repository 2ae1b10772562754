// src/logging.rs

//! Process-wide `tracing` subscriber for the `mcuflow` binary.
//!
//! The level comes from the first of these that is set:
//! 1. `--log-level` on the command line
//! 2. `MCUFLOW_LOG` (e.g. "info", "debug")
//! 3. `[defaults].log_level` in `environment.toml`
//! 4. `info`
//!
//! Everything is written to stderr. A process-pool worker answers the
//! scheduler with a single JSON document on stdout, so a log line there
//! would make the parent reject the whole batch. The parent replays each
//! worker stderr line at debug level instead.

use anyhow::Result;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

/// Install the global subscriber.
///
/// Workers inherit the parent's environment, so `MCUFLOW_LOG` applies to
/// them as well. `env_default` is only consulted once the environment
/// file has loaded; `main` passes `None` when reporting a load error.
pub fn init_logging(cli_level: Option<LogLevel>, env_default: Option<&str>) -> Result<()> {
    let level = match cli_level {
        Some(lvl) => level_from_log_level(lvl),
        None => std::env::var("MCUFLOW_LOG")
            .ok()
            .and_then(|s| parse_level_str(&s))
            .or_else(|| env_default.and_then(parse_level_str))
            .unwrap_or(tracing::Level::INFO),
    };

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

pub(crate) fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
