use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Concurrency strategy used by the session scheduler.
///
/// - `ThreadPool`: batches run on blocking worker threads inside this
///   process. Supports per-stage barriers and the init stage.
/// - `ProcessPool`: batches are shipped as serialized run initializers to
///   child `mcuflow worker` processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    ThreadPool,
    ProcessPool,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "thread_pool" | "thread" => Ok(ExecutorKind::ThreadPool),
            "process_pool" | "process" => Ok(ExecutorKind::ProcessPool),
            other => Err(format!(
                "invalid executor: {other} (expected \"thread_pool\" or \"process_pool\")"
            )),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::ThreadPool => f.write_str("thread_pool"),
            ExecutorKind::ProcessPool => f.write_str("process_pool"),
        }
    }
}

/// Access mode for the dependency directory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsLockMode {
    /// Shared access, used while running flows.
    Read,
    /// Exclusive access, used while installing dependencies.
    Write,
}

/// Status of a session workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Open,
    Closed,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}
