// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::session::stage::RunStage;

#[derive(Error, Debug)]
pub enum McuflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unable to resolve dependency '{key}' needed by task '{task}'")]
    UnresolvedDependency { task: String, key: String },

    #[error("Key '{key}' is provided by both '{first}' and '{second}'")]
    AmbiguousProvider {
        key: String,
        first: String,
        second: String,
    },

    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in task graph: {0}")]
    DagCycle(String),

    #[error("Task '{task}' needs the value of '{key}' which is not set")]
    MissingInput { task: String, key: String },

    #[error("Task '{task}' did not set the value of '{key}'")]
    MissingOutput { task: String, key: String },

    #[error("Task '{task}' failed: {source:#}")]
    TaskFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Run {run} can not enter stage {stage} while at stage {current}")]
    StageOrder {
        run: usize,
        stage: RunStage,
        current: RunStage,
    },

    #[error("Parallel processing of the same run is not allowed (run {0})")]
    RunBusy(usize),

    #[error("Environment busy: lock '{lock}' is held by {holder}")]
    LockTimeout { lock: String, holder: String },

    #[error("Stage {stage} failed: {source:#}")]
    Stage {
        stage: RunStage,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, McuflowError>;
